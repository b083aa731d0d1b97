//! Flow Manager
//!
//! The facade around the scheduler. A manager validates its
//! configuration once at construction, then offers two entry points:
//! an immediate `run` gated by a counting semaphore that bounds how many
//! flows execute at once, and an `enqueue` that feeds a bounded work
//! queue drained by a single background consumer. A full queue blocks
//! the producer rather than dropping work or buffering without limit.

use std::sync::{Arc, Mutex};

use log::{info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::context::FlowContext;
use crate::workflow::model::FlowConfiguration;
use crate::workflow::validator::{validate_configuration, ConfigError};

use super::cancel::CancelSignal;
use super::result::{FlowError, FlowResult};
use super::scheduler::Scheduler;

/// Default bound on concurrently executing flows.
const DEFAULT_CONCURRENT_FLOWS: usize = 4;

/// Default capacity of the work queue.
const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Errors from the work-queue surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was closed; no further work is accepted.
    #[error("work queue is closed")]
    Closed,

    /// The cancellation signal fired while waiting for queue capacity.
    #[error("enqueue cancelled while waiting for queue capacity")]
    Cancelled,

    /// `start_processing` was already called.
    #[error("queue consumer already started")]
    ConsumerStarted,
}

/// Receives the outcome of each queued run.
///
/// The background consumer reports every completed run through this
/// side channel; implement it to route outcomes wherever they belong.
pub trait ResultHandler: Send + Sync {
    fn on_result(&self, result: &FlowResult);
}

/// Default handler: reports outcomes through the log.
pub struct LogResultHandler;

impl ResultHandler for LogResultHandler {
    fn on_result(&self, result: &FlowResult) {
        match &result.error {
            None => info!("Queued run completed: {} steps", result.steps.len()),
            Some(error) => warn!("Queued run failed ({}): {}", error.kind, error),
        }
    }
}

/// Tunable limits for a manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// How many flows may execute concurrently.
    pub concurrency_limit: usize,
    /// Fan-out bound handed to the scheduler.
    pub max_parallel: usize,
    /// Capacity of the bounded work queue.
    pub queue_capacity: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENT_FLOWS,
            max_parallel: num_cpus::get(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

type QueueItem = (FlowContext, CancelSignal);

struct ManagerShared {
    config: FlowConfiguration,
    scheduler: Scheduler,
    permits: Semaphore,
    handler: Arc<dyn ResultHandler>,
}

impl ManagerShared {
    async fn run(&self, ctx: FlowContext, cancel: CancelSignal) -> FlowResult {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            // The semaphore only closes when the manager is torn down
            // mid-wait; report the run as cancelled.
            Err(_) => return FlowResult::failed(FlowError::cancelled(), Vec::new()),
        };
        self.scheduler.execute(&self.config, ctx, cancel).await
    }
}

/// Validated entry point for running and queueing flows.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::{FlowConfiguration, FlowContext, FlowManager, StepDescriptor};
/// # use async_trait::async_trait;
/// # use flowrunner::{CancelSignal, StepError, UnitStep};
/// # struct Generate;
/// # #[async_trait]
/// # impl UnitStep for Generate {
/// #     async fn run(&self, _: &FlowContext, _: &CancelSignal) -> Result<(), StepError> { Ok(()) }
/// # }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = FlowConfiguration::new()
///         .add_step(StepDescriptor::unit("generate", Generate));
///     let manager = FlowManager::new(config)?;
///
///     let result = manager.run(&FlowContext::new()).await;
///     assert!(result.success);
///     Ok(())
/// }
/// ```
pub struct FlowManager {
    shared: Arc<ManagerShared>,
    queue_tx: Mutex<Option<mpsc::Sender<QueueItem>>>,
    queue_rx: Mutex<Option<mpsc::Receiver<QueueItem>>>,
}

impl FlowManager {
    /// Creates a manager with default limits.
    ///
    /// Fails fast with a [`ConfigError`] if the configuration is
    /// structurally invalid; no run can be attempted against a bad
    /// configuration.
    pub fn new(config: FlowConfiguration) -> Result<Self, ConfigError> {
        Self::with_options(config, ManagerOptions::default())
    }

    /// Creates a manager with explicit limits.
    pub fn with_options(
        config: FlowConfiguration,
        options: ManagerOptions,
    ) -> Result<Self, ConfigError> {
        Self::with_processor(config, options, Arc::new(LogResultHandler))
    }

    /// Creates a manager with explicit limits and a custom outcome
    /// handler for the queue consumer.
    pub fn with_processor(
        config: FlowConfiguration,
        options: ManagerOptions,
        handler: Arc<dyn ResultHandler>,
    ) -> Result<Self, ConfigError> {
        validate_configuration(&config)?;

        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));

        info!(
            "Manager ready: {} steps, concurrency limit {}, queue capacity {}",
            config.len(),
            options.concurrency_limit.max(1),
            options.queue_capacity.max(1)
        );

        Ok(Self {
            shared: Arc::new(ManagerShared {
                config,
                scheduler: Scheduler::new(options.max_parallel),
                permits: Semaphore::new(options.concurrency_limit.max(1)),
                handler,
            }),
            queue_tx: Mutex::new(Some(tx)),
            queue_rx: Mutex::new(Some(rx)),
        })
    }

    /// Returns the configuration this manager executes.
    pub fn configuration(&self) -> &FlowConfiguration {
        &self.shared.config
    }

    /// Runs the configuration against the given context now.
    ///
    /// Waits for a slot when the concurrent-flow limit is reached.
    /// Ordinary step failures never surface as errors here; they are
    /// reported inside the returned [`FlowResult`].
    pub async fn run(&self, ctx: &FlowContext) -> FlowResult {
        self.run_with(ctx, CancelSignal::new()).await
    }

    /// Runs with an external cancellation signal.
    pub async fn run_with(&self, ctx: &FlowContext, cancel: CancelSignal) -> FlowResult {
        self.shared.run(ctx.clone(), cancel).await
    }

    /// Queues a context for the background consumer.
    ///
    /// Blocks while the queue is full; fails once the queue is closed.
    pub async fn enqueue(&self, ctx: &FlowContext) -> Result<(), QueueError> {
        self.enqueue_with(ctx, CancelSignal::new()).await
    }

    /// Queues a context along with a cancellation signal.
    ///
    /// The signal both aborts the wait for queue capacity and travels
    /// with the item into its eventual run.
    pub async fn enqueue_with(
        &self,
        ctx: &FlowContext,
        cancel: CancelSignal,
    ) -> Result<(), QueueError> {
        let tx = self
            .queue_tx
            .lock()
            .expect("queue sender lock poisoned")
            .clone()
            .ok_or(QueueError::Closed)?;

        tokio::select! {
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            sent = tx.send((ctx.clone(), cancel.clone())) => {
                sent.map_err(|_| QueueError::Closed)
            }
        }
    }

    /// Starts the background consumer.
    ///
    /// The consumer drains the queue in FIFO order, runs each context
    /// under the same concurrency limit as [`FlowManager::run`], and
    /// reports every outcome through the configured [`ResultHandler`].
    /// It stops once the queue has been closed and fully drained. Must
    /// be called from within a tokio runtime.
    pub fn start_processing(&self) -> Result<JoinHandle<()>, QueueError> {
        let mut rx = self
            .queue_rx
            .lock()
            .expect("queue receiver lock poisoned")
            .take()
            .ok_or(QueueError::ConsumerStarted)?;

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            info!("Queue consumer started");
            while let Some((ctx, cancel)) = rx.recv().await {
                let result = shared.run(ctx, cancel).await;
                shared.handler.on_result(&result);
            }
            info!("Work queue closed and drained; consumer stopping");
        });

        Ok(handle)
    }

    /// Closes the queue.
    ///
    /// No further items are accepted; items already queued (and senders
    /// currently blocked in `enqueue`) still drain before the consumer
    /// stops.
    pub fn close_queue(&self) {
        let closed = self
            .queue_tx
            .lock()
            .expect("queue sender lock poisoned")
            .take()
            .is_some();
        if closed {
            info!("Work queue closed");
        }
    }
}

impl std::fmt::Debug for FlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowManager")
            .field("steps", &self.shared.config.len())
            .field("max_parallel", &self.shared.scheduler.max_parallel())
            .finish()
    }
}
