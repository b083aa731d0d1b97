//! Step Scheduler
//!
//! The core scheduling algorithm: iterative round-based readiness
//! convergence over a validated configuration.
//!
//! Each round partitions the unexecuted steps into those that are ready
//! (every dependency executed, condition absent or true) and runs either
//! the whole ready-parallel set concurrently or exactly one ready
//! sequential step. Running a single sequential step per round is
//! deliberate: conditions are re-evaluated against the live context
//! before the next step is chosen, so a step's writes can make a later
//! step eligible immediately. A round with work remaining but nothing
//! ready is a deadlock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::context::{ContextKey, FlowContext};
use crate::workflow::model::{FlowConfiguration, StepDescriptor};
use crate::workflow::step::StepError;

use super::cancel::CancelSignal;
use super::result::{FlowError, FlowResult, StepResult};

/// Outcome of attempting one step.
enum StepOutcome {
    /// Cancellation fired before the step started.
    Skipped,
    /// The step ran; the error is carried alongside the log record so
    /// the original cause survives into the run's failure.
    Finished(StepResult, Option<StepError>),
}

/// Runs one step and records its timing and outcome.
async fn run_step(step: &StepDescriptor, ctx: &FlowContext, cancel: &CancelSignal) -> StepOutcome {
    if cancel.is_cancelled() {
        debug!("Skipping step '{}': run cancelled", step.name());
        return StepOutcome::Skipped;
    }

    info!("Starting step: {}", step.name());
    let started_at = Utc::now();
    let invoked = step.handle().invoke(ctx, cancel).await;
    let finished_at = Utc::now();
    let duration_ms = (finished_at - started_at).num_milliseconds();

    match invoked {
        Ok(output) => {
            info!("Step '{}' completed in {} ms", step.name(), duration_ms);
            StepOutcome::Finished(
                StepResult {
                    step_name: step.name().name().to_string(),
                    success: true,
                    output,
                    error: None,
                    started_at,
                    finished_at,
                    duration_ms,
                },
                None,
            )
        }
        Err(e) => {
            error!("Step '{}' failed: {}", step.name(), e);
            StepOutcome::Finished(
                StepResult {
                    step_name: step.name().name().to_string(),
                    success: false,
                    output: None,
                    error: Some(e.to_string()),
                    started_at,
                    finished_at,
                    duration_ms,
                },
                Some(e),
            )
        }
    }
}

/// Executes a configuration's steps against a shared context.
///
/// The scheduler owns no cross-run state; one instance can serve any
/// number of runs. Concurrent fan-out within a parallel round is bounded
/// by `max_parallel`.
#[derive(Debug, Clone)]
pub struct Scheduler {
    max_parallel: usize,
}

impl Scheduler {
    /// Creates a scheduler with the given fan-out bound (clamped to 1+).
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }

    /// Returns the fan-out bound.
    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Runs the configuration to completion, deadlock, failure or
    /// cancellation.
    ///
    /// The configuration is assumed structurally valid (unique names,
    /// dependencies that exist); the manager checks that once at
    /// construction.
    pub async fn execute(
        &self,
        config: &FlowConfiguration,
        ctx: FlowContext,
        cancel: CancelSignal,
    ) -> FlowResult {
        let mut remaining: Vec<StepDescriptor> = config.steps().to_vec();
        let mut executed: HashSet<ContextKey> = HashSet::with_capacity(remaining.len());
        let mut results: Vec<StepResult> = Vec::with_capacity(remaining.len());
        let mut outputs: HashMap<String, Value> = HashMap::new();

        debug!(
            "Scheduling {} steps (max parallel: {})",
            remaining.len(),
            self.max_parallel
        );

        while !remaining.is_empty() {
            if cancel.is_cancelled() {
                warn!("Run cancelled with {} steps remaining", remaining.len());
                return FlowResult::failed(FlowError::cancelled(), results);
            }

            // One readiness evaluation per step per round; conditions see
            // every context write from previous rounds.
            let ready: Vec<bool> = remaining
                .iter()
                .map(|step| step.is_ready(&executed, &ctx))
                .collect();

            let any_ready_parallel = remaining
                .iter()
                .zip(&ready)
                .any(|(step, ready)| *ready && step.is_parallel());
            let any_ready = ready.iter().any(|r| *r);

            if !any_ready {
                let stuck: Vec<String> = remaining
                    .iter()
                    .map(|s| s.name().name().to_string())
                    .collect();
                warn!("Deadlock detected; stuck steps: {:?}", stuck);
                return FlowResult::failed(FlowError::deadlock(&stuck), results);
            }

            if any_ready_parallel {
                // Fan out every ready parallel step; the round does not
                // advance until the whole batch has completed.
                let mut batch = Vec::new();
                let mut rest = Vec::with_capacity(remaining.len());
                for (step, ready) in remaining.drain(..).zip(&ready) {
                    if *ready && step.is_parallel() {
                        batch.push(step);
                    } else {
                        rest.push(step);
                    }
                }
                remaining = rest;

                debug!("Dispatching parallel batch of {} steps", batch.len());
                let permits = Arc::new(Semaphore::new(self.max_parallel));
                let mut tasks = JoinSet::new();
                for step in batch {
                    let permits = Arc::clone(&permits);
                    let ctx = ctx.clone();
                    let cancel = cancel.clone();
                    tasks.spawn(async move {
                        let _permit = permits.acquire_owned().await.ok();
                        run_step(&step, &ctx, &cancel).await
                    });
                }

                let mut batch_error: Option<FlowError> = None;
                let mut observed_cancel = false;
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok(StepOutcome::Finished(record, step_error)) => {
                            if record.success {
                                executed.insert(ContextKey::new(&record.step_name));
                                if let Some(value) = record.output.clone() {
                                    outputs.insert(record.step_name.clone(), value);
                                }
                            } else if batch_error.is_none() {
                                let cause = step_error
                                    .unwrap_or_else(|| StepError::failed("unknown step failure"));
                                batch_error =
                                    Some(FlowError::exception(record.step_name.clone(), cause));
                            }
                            results.push(record);
                        }
                        Ok(StepOutcome::Skipped) => {
                            observed_cancel = true;
                        }
                        Err(join_error) => {
                            error!("Step task aborted: {}", join_error);
                            if batch_error.is_none() {
                                batch_error = Some(FlowError::exception_message(format!(
                                    "step task aborted: {}",
                                    join_error
                                )));
                            }
                        }
                    }
                }

                if let Some(error) = batch_error {
                    return FlowResult::failed(error, results);
                }
                if observed_cancel || cancel.is_cancelled() {
                    warn!("Run cancelled during parallel batch");
                    return FlowResult::failed(FlowError::cancelled(), results);
                }
            } else {
                // Exactly one sequential step, then re-evaluate the round
                // so its context effects reach the other conditions.
                let index = ready
                    .iter()
                    .position(|r| *r)
                    .unwrap_or_default();
                let step = remaining.remove(index);

                match run_step(&step, &ctx, &cancel).await {
                    StepOutcome::Skipped => {
                        return FlowResult::failed(FlowError::cancelled(), results);
                    }
                    StepOutcome::Finished(record, step_error) => {
                        let succeeded = record.success;
                        let name = record.step_name.clone();
                        let output = record.output.clone();
                        results.push(record);

                        if succeeded {
                            executed.insert(ContextKey::new(&name));
                            if let Some(value) = output {
                                outputs.insert(name, value);
                            }
                        } else {
                            let cause = step_error
                                .unwrap_or_else(|| StepError::failed("unknown step failure"));
                            return FlowResult::failed(FlowError::exception(name, cause), results);
                        }
                    }
                }
            }
        }

        info!("Run completed: {} steps executed", results.len());
        FlowResult::completed(results, outputs)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::result::FlowErrorKind;
    use crate::workflow::model::StepDescriptor;
    use crate::workflow::step::{StepError, UnitStep, ValueStep};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Appends its name to a shared log, optionally sleeping first.
    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        delay_ms: u64,
    }

    impl Recorder {
        fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                log: Arc::clone(log),
                delay_ms: 0,
            }
        }

        fn slow(name: &str, log: &Arc<Mutex<Vec<String>>>, delay_ms: u64) -> Self {
            Self {
                name: name.to_string(),
                log: Arc::clone(log),
                delay_ms,
            }
        }
    }

    #[async_trait]
    impl UnitStep for Recorder {
        async fn run(&self, _ctx: &FlowContext, _cancel: &CancelSignal) -> Result<(), StepError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.log.lock().unwrap().push(self.name.clone());
            Ok(())
        }
    }

    /// Tracks how many instances run at once and the observed peak.
    struct Gauge {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        hold_ms: u64,
    }

    #[async_trait]
    impl UnitStep for Gauge {
        async fn run(&self, _ctx: &FlowContext, _cancel: &CancelSignal) -> Result<(), StepError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.hold_ms)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Produce(u64);

    #[async_trait]
    impl ValueStep for Produce {
        type Output = u64;

        async fn run(
            &self,
            _ctx: &FlowContext,
            _cancel: &CancelSignal,
        ) -> Result<Self::Output, StepError> {
            Ok(self.0)
        }
    }

    struct Fail;

    #[async_trait]
    impl UnitStep for Fail {
        async fn run(&self, _ctx: &FlowContext, _cancel: &CancelSignal) -> Result<(), StepError> {
            Err(StepError::failed("deliberate failure"))
        }
    }

    fn order_of(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_empty_configuration_completes_immediately() {
        let result = Scheduler::default()
            .execute(
                &FlowConfiguration::new(),
                FlowContext::new(),
                CancelSignal::new(),
            )
            .await;

        assert!(result.success);
        assert!(result.steps.is_empty());
    }

    #[tokio::test]
    async fn test_dependencies_run_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let config = FlowConfiguration::new()
            .add_step(StepDescriptor::unit("second", Recorder::new("second", &log)).depends_on("first"))
            .add_step(StepDescriptor::unit("first", Recorder::new("first", &log)));

        let result = Scheduler::default()
            .execute(&config, FlowContext::new(), CancelSignal::new())
            .await;

        assert!(result.success);
        assert_eq!(order_of(&log), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_layered_dag_respects_every_edge() {
        // Layered graph: a -> (b, c) -> d, plus an edge a -> d.
        let log = Arc::new(Mutex::new(Vec::new()));
        let config = FlowConfiguration::new()
            .add_step(StepDescriptor::unit("a", Recorder::new("a", &log)))
            .add_step(
                StepDescriptor::unit("b", Recorder::slow("b", &log, 20))
                    .depends_on("a")
                    .with_parallel(true),
            )
            .add_step(
                StepDescriptor::unit("c", Recorder::new("c", &log))
                    .depends_on("a")
                    .with_parallel(true),
            )
            .add_step(
                StepDescriptor::unit("d", Recorder::new("d", &log))
                    .depends_on("b")
                    .depends_on("c")
                    .depends_on("a"),
            );

        let result = Scheduler::default()
            .execute(&config, FlowContext::new(), CancelSignal::new())
            .await;
        assert!(result.success);

        let order = order_of(&log);
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        for (before, after) in [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d"), ("a", "d")] {
            assert!(
                position(before) < position(after),
                "expected {} before {}, got {:?}",
                before,
                after,
                order
            );
        }
    }

    #[tokio::test]
    async fn test_generated_dag_respects_every_edge() {
        // Deterministic xorshift stream; steps only depend on
        // earlier-indexed steps, so every generated graph is acyclic.
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut edges: Vec<(usize, usize)> = Vec::new();
        let mut config = FlowConfiguration::new();

        for i in 0..12 {
            let name = format!("n{}", i);
            let mut step = StepDescriptor::unit(name.as_str(), Recorder::new(&name, &log))
                .with_parallel(next() % 2 == 0);
            for j in 0..i {
                if next() % 3 == 0 {
                    step = step.depends_on(format!("n{}", j));
                    edges.push((j, i));
                }
            }
            config = config.add_step(step);
        }
        assert!(!edges.is_empty());

        let result = Scheduler::new(4)
            .execute(&config, FlowContext::new(), CancelSignal::new())
            .await;
        assert!(result.success, "error: {:?}", result.error);

        let order = order_of(&log);
        let position =
            |i: usize| order.iter().position(|n| *n == format!("n{}", i)).unwrap();
        for (from, to) in edges {
            assert!(
                position(from) < position(to),
                "expected n{} before n{}, got {:?}",
                from,
                to,
                order
            );
        }
    }

    #[tokio::test]
    async fn test_circular_dependency_terminates_with_deadlock() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let config = FlowConfiguration::new()
            .add_step(StepDescriptor::unit("A", Recorder::new("A", &log)).depends_on("B"))
            .add_step(StepDescriptor::unit("B", Recorder::new("B", &log)).depends_on("A"));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            Scheduler::default().execute(&config, FlowContext::new(), CancelSignal::new()),
        )
        .await
        .expect("deadlock must terminate, not hang");

        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.kind, FlowErrorKind::Deadlock);
        assert!(error.message.contains("A"));
        assert!(error.message.contains("B"));
        assert!(order_of(&log).is_empty());
    }

    #[tokio::test]
    async fn test_condition_never_true_is_deadlock() {
        let config = FlowConfiguration::new().add_step(
            StepDescriptor::unit("gated", Fail).with_condition(|_: &FlowContext| false),
        );

        let result = Scheduler::default()
            .execute(&config, FlowContext::new(), CancelSignal::new())
            .await;

        assert_eq!(result.error_kind(), Some(FlowErrorKind::Deadlock));
        assert!(result.error.unwrap().message.contains("gated"));
    }

    #[tokio::test]
    async fn test_condition_reevaluated_after_each_sequential_step() {
        // "unlock" has no dependency edge to "gated"; only the context
        // write made by "unlock" satisfies the condition. Running one
        // sequential step per round makes that write visible in time.
        let log = Arc::new(Mutex::new(Vec::new()));

        struct Unlock(Arc<Mutex<Vec<String>>>);

        #[async_trait]
        impl UnitStep for Unlock {
            async fn run(&self, ctx: &FlowContext, _cancel: &CancelSignal) -> Result<(), StepError> {
                ctx.set("unlocked", true);
                self.0.lock().unwrap().push("unlock".to_string());
                Ok(())
            }
        }

        let config = FlowConfiguration::new()
            .add_step(
                StepDescriptor::unit("gated", Recorder::new("gated", &log))
                    .with_condition(|ctx: &FlowContext| ctx.contains("unlocked")),
            )
            .add_step(StepDescriptor::unit("unlock", Unlock(Arc::clone(&log))));

        let result = Scheduler::default()
            .execute(&config, FlowContext::new(), CancelSignal::new())
            .await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(order_of(&log), vec!["unlock", "gated"]);
    }

    #[tokio::test]
    async fn test_sequential_steps_never_overlap() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut config = FlowConfiguration::new();
        for name in ["s1", "s2", "s3", "s4"] {
            config = config.add_step(StepDescriptor::unit(
                name,
                Gauge {
                    current: Arc::clone(&current),
                    peak: Arc::clone(&peak),
                    hold_ms: 10,
                },
            ));
        }

        let result = Scheduler::new(8)
            .execute(&config, FlowContext::new(), CancelSignal::new())
            .await;

        assert!(result.success);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parallel_steps_overlap() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut config = FlowConfiguration::new();
        for name in ["p1", "p2", "p3"] {
            config = config.add_step(
                StepDescriptor::unit(
                    name,
                    Gauge {
                        current: Arc::clone(&current),
                        peak: Arc::clone(&peak),
                        hold_ms: 50,
                    },
                )
                .with_parallel(true),
            );
        }

        let result = Scheduler::new(8)
            .execute(&config, FlowContext::new(), CancelSignal::new())
            .await;

        assert!(result.success);
        assert!(
            peak.load(Ordering::SeqCst) >= 2,
            "parallel batch should overlap, peak was {}",
            peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_fan_out_bounded_by_max_parallel() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut config = FlowConfiguration::new();
        for i in 0..6 {
            config = config.add_step(
                StepDescriptor::unit(
                    format!("p{}", i),
                    Gauge {
                        current: Arc::clone(&current),
                        peak: Arc::clone(&peak),
                        hold_ms: 30,
                    },
                )
                .with_parallel(true),
            );
        }

        let result = Scheduler::new(2)
            .execute(&config, FlowContext::new(), CancelSignal::new())
            .await;

        assert!(result.success);
        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "fan-out exceeded limit: {}",
            peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_round_waits_for_whole_parallel_batch() {
        // "after" depends only on "fast", but the round barrier means it
        // must still observe "slow" completed.
        let log = Arc::new(Mutex::new(Vec::new()));
        let config = FlowConfiguration::new()
            .add_step(StepDescriptor::unit("fast", Recorder::new("fast", &log)).with_parallel(true))
            .add_step(
                StepDescriptor::unit("slow", Recorder::slow("slow", &log, 60)).with_parallel(true),
            )
            .add_step(StepDescriptor::unit("after", Recorder::new("after", &log)).depends_on("fast"));

        let result = Scheduler::default()
            .execute(&config, FlowContext::new(), CancelSignal::new())
            .await;

        assert!(result.success);
        let order = order_of(&log);
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(position("slow") < position("after"));
    }

    #[tokio::test]
    async fn test_value_step_outputs_collected() {
        let config = FlowConfiguration::new()
            .add_step(StepDescriptor::value("count", Produce(11)))
            .add_step(StepDescriptor::value("total", Produce(42)).depends_on("count"));

        let result = Scheduler::default()
            .execute(&config, FlowContext::new(), CancelSignal::new())
            .await;

        assert!(result.success);
        assert_eq!(result.output("count"), Some(&serde_json::json!(11)));
        assert_eq!(result.output("total"), Some(&serde_json::json!(42)));
    }

    #[tokio::test]
    async fn test_step_failure_aborts_run() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let config = FlowConfiguration::new()
            .add_step(StepDescriptor::unit("ok", Recorder::new("ok", &log)))
            .add_step(StepDescriptor::unit("bad", Fail).depends_on("ok"))
            .add_step(StepDescriptor::unit("never", Recorder::new("never", &log)).depends_on("bad"));

        let result = Scheduler::default()
            .execute(&config, FlowContext::new(), CancelSignal::new())
            .await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.kind, FlowErrorKind::Exception);
        assert_eq!(error.step_name.as_deref(), Some("bad"));
        assert_eq!(order_of(&log), vec!["ok"]);

        // The failed step still appears in the execution log.
        assert!(result.steps.iter().any(|s| s.step_name == "bad" && !s.success));
    }

    #[tokio::test]
    async fn test_cancellation_stops_scheduling() {
        // The first step fires the signal itself; the round boundary
        // check must stop the second step from ever starting.
        let log = Arc::new(Mutex::new(Vec::new()));

        struct SelfCancel(CancelSignal);

        #[async_trait]
        impl UnitStep for SelfCancel {
            async fn run(&self, _ctx: &FlowContext, _cancel: &CancelSignal) -> Result<(), StepError> {
                self.0.cancel();
                Ok(())
            }
        }

        let cancel = CancelSignal::new();
        let config = FlowConfiguration::new()
            .add_step(StepDescriptor::unit("trigger", SelfCancel(cancel.clone())))
            .add_step(StepDescriptor::unit("never", Recorder::new("never", &log)).depends_on("trigger"));

        let result = Scheduler::default()
            .execute(&config, FlowContext::new(), cancel)
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(FlowErrorKind::Cancelled));
        assert!(result.outputs.is_none());
        assert!(order_of(&log).is_empty());
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_executes_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancelSignal::new();
        cancel.cancel();

        let config =
            FlowConfiguration::new().add_step(StepDescriptor::unit("step", Recorder::new("step", &log)));

        let result = Scheduler::default()
            .execute(&config, FlowContext::new(), cancel)
            .await;

        assert_eq!(result.error_kind(), Some(FlowErrorKind::Cancelled));
        assert!(order_of(&log).is_empty());
    }

    #[tokio::test]
    async fn test_runs_are_independent() {
        struct WriteOnce;

        #[async_trait]
        impl UnitStep for WriteOnce {
            async fn run(&self, ctx: &FlowContext, _cancel: &CancelSignal) -> Result<(), StepError> {
                if !ctx.try_set("mark", 1)? {
                    return Err(StepError::failed("context leaked between runs"));
                }
                Ok(())
            }
        }

        let config = FlowConfiguration::new().add_step(StepDescriptor::unit("write", WriteOnce));
        let scheduler = Scheduler::default();

        let first = scheduler
            .execute(&config, FlowContext::new(), CancelSignal::new())
            .await;
        let second = scheduler
            .execute(&config, FlowContext::new(), CancelSignal::new())
            .await;

        assert!(first.success);
        assert!(second.success, "error: {:?}", second.error);
    }

    #[tokio::test]
    async fn test_scheduler_clamps_zero_parallelism() {
        assert_eq!(Scheduler::new(0).max_parallel(), 1);
    }
}
