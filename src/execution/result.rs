//! Run Outcomes
//!
//! Immutable records describing how a run and its individual steps
//! finished. Run-time failures (deadlock, step errors, cancellation) are
//! carried inside a [`FlowResult`] rather than propagated as faults;
//! callers inspect `success` and `error`.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::workflow::step::StepError;
use crate::workflow::validator::ConfigError;

/// Classifies why a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowErrorKind {
    /// Steps remain but none can ever become ready.
    Deadlock,
    /// A step implementation returned an error or panicked.
    Exception,
    /// The cancellation signal fired.
    Cancelled,
    /// A configuration problem, surfaced at construction time.
    Config,
}

impl fmt::Display for FlowErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Deadlock => "deadlock",
            Self::Exception => "exception",
            Self::Cancelled => "cancelled",
            Self::Config => "configuration error",
        };
        f.write_str(label)
    }
}

/// A failed run's error record.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct FlowError {
    /// What class of failure occurred.
    pub kind: FlowErrorKind,
    /// Human-readable description.
    pub message: String,
    /// The step involved, when the failure is attributable to one.
    pub step_name: Option<String>,
    /// The underlying error, when one exists.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl FlowError {
    /// A deadlock naming every step that can no longer become ready.
    pub fn deadlock(stuck: &[String]) -> Self {
        Self {
            kind: FlowErrorKind::Deadlock,
            message: format!(
                "no step can become ready; {} step(s) stuck: {}",
                stuck.len(),
                stuck.join(", ")
            ),
            step_name: None,
            source: None,
        }
    }

    /// A step failure, preserving the step name and original error.
    pub fn exception(step_name: impl Into<String>, source: StepError) -> Self {
        let step_name = step_name.into();
        Self {
            kind: FlowErrorKind::Exception,
            message: format!("step '{}' failed: {}", step_name, source),
            step_name: Some(step_name),
            source: Some(Box::new(source)),
        }
    }

    /// A step failure with only a message (e.g. a panicked task).
    pub fn exception_message(message: impl Into<String>) -> Self {
        Self {
            kind: FlowErrorKind::Exception,
            message: message.into(),
            step_name: None,
            source: None,
        }
    }

    /// A run stopped by the cancellation signal.
    pub fn cancelled() -> Self {
        Self {
            kind: FlowErrorKind::Cancelled,
            message: "run cancelled".to_string(),
            step_name: None,
            source: None,
        }
    }
}

impl From<ConfigError> for FlowError {
    fn from(source: ConfigError) -> Self {
        Self {
            kind: FlowErrorKind::Config,
            message: source.to_string(),
            step_name: None,
            source: Some(Box::new(source)),
        }
    }
}

/// The record of one executed step.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Name of the step.
    pub step_name: String,
    /// Whether the step finished without error.
    pub success: bool,
    /// Serialized output for steps that produce one.
    pub output: Option<Value>,
    /// Error description for failed steps.
    pub error: Option<String>,
    /// When the step started executing.
    pub started_at: DateTime<Utc>,
    /// When the step finished.
    pub finished_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: i64,
}

/// The outcome of one run.
///
/// `success` and `error` are mutually exclusive; `outputs` is present
/// only on success. `steps` is the ordered log of every step that
/// actually executed, kept on failures too for diagnosis.
#[derive(Debug)]
pub struct FlowResult {
    /// Whether every step completed.
    pub success: bool,
    /// The failure record, if the run failed.
    pub error: Option<FlowError>,
    /// Collected step outputs keyed by step name.
    pub outputs: Option<HashMap<String, Value>>,
    /// Per-step execution log in completion order.
    pub steps: Vec<StepResult>,
}

impl FlowResult {
    /// Builds a successful result.
    pub(crate) fn completed(steps: Vec<StepResult>, outputs: HashMap<String, Value>) -> Self {
        Self {
            success: true,
            error: None,
            outputs: Some(outputs),
            steps,
        }
    }

    /// Builds a failed result.
    pub(crate) fn failed(error: FlowError, steps: Vec<StepResult>) -> Self {
        Self {
            success: false,
            error: Some(error),
            outputs: None,
            steps,
        }
    }

    /// Returns the failure kind, if the run failed.
    pub fn error_kind(&self) -> Option<FlowErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Returns the output recorded for a step, if any.
    pub fn output(&self, step_name: &str) -> Option<&Value> {
        self.outputs.as_ref().and_then(|o| o.get(step_name))
    }
}
