//! Single-consumer dispatch loop.
//!
//! The worker pops one message at a time, runs the handler registered for
//! its topic under a fresh per-job deadline, and logs the outcome. Failed
//! jobs are not retried and nothing is requeued.

use crate::context::JobContext;
use crate::error::{JobError, QueueError};
use crate::message::{Message, Topic};
use crate::queue::Queue;
use crate::telemetry;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Extra time a handler gets past its deadline to release what it holds
/// before the loop abandons it.
pub const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_secs(30);

const POP_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Executes the jobs of one topic.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext, message: &Message) -> Result<(), JobError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// Waiting on the queue.
    Idle,
    Processing,
    ShuttingDown,
}

pub struct Worker {
    queue: Arc<dyn Queue>,
    handlers: HashMap<Topic, Arc<dyn JobHandler>>,
    job_timeout: Duration,
    cleanup_grace: Duration,
    pop_error_backoff: Duration,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    pub fn new(queue: Arc<dyn Queue>, job_timeout: Duration) -> Self {
        let (state, _) = watch::channel(WorkerState::Running);
        Self {
            queue,
            handlers: HashMap::new(),
            job_timeout,
            cleanup_grace: DEFAULT_CLEANUP_GRACE,
            pop_error_backoff: POP_ERROR_BACKOFF,
            state,
        }
    }

    /// Routes messages of `topic` to `handler`, replacing any previous one.
    pub fn with_handler(mut self, topic: Topic, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(topic, handler);
        self
    }

    pub fn with_cleanup_grace(mut self, grace: Duration) -> Self {
        self.cleanup_grace = grace;
        self
    }

    pub fn with_pop_error_backoff(mut self, backoff: Duration) -> Self {
        self.pop_error_backoff = backoff;
        self
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Processes messages until `shutdown` fires.
    ///
    /// Each iteration pops one message, runs its topic's handler under a
    /// fresh job deadline and logs the outcome. Malformed messages never
    /// reach a handler, a handler panic fails only its own job, and a queue
    /// transport error backs the loop off before the next pop. Idle polls
    /// record a heartbeat with the queue length.
    ///
    /// Shutdown is only observed between jobs; a job already running keeps
    /// its own deadline.
    ///
    /// # Arguments
    ///
    /// * `shutdown` - Cancelled to stop the loop; the state then moves to
    ///   [`WorkerState::ShuttingDown`]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(topics = self.handlers.len(), "Worker started");
        self.set_state(WorkerState::Running);

        loop {
            self.set_state(WorkerState::Idle);

            let message = match self.queue.pop(&shutdown).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("Received empty message");
                    self.heartbeat().await;
                    continue;
                }
                Err(QueueError::Cancelled) => break,
                Err(e) => {
                    error!(error = %e, "Failed to pop queue");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.pop_error_backoff) => continue,
                    }
                }
            };

            self.set_state(WorkerState::Processing);
            let _ = self.process(message).await;
            self.set_state(WorkerState::Running);
        }

        self.set_state(WorkerState::ShuttingDown);
        info!("Worker shutdown complete");
    }

    /// Runs one message through its handler and logs the outcome.
    ///
    /// # Returns
    ///
    /// The handler's result, or [`JobError::UnknownTopic`] when no handler
    /// is registered, [`JobError::Panicked`] when it panicked and
    /// [`JobError::Timeout`] when it outlived its deadline plus the cleanup
    /// grace.
    pub async fn process(&self, message: Message) -> Result<(), JobError> {
        let topic = message.topic();
        info!(topic = %topic, message = ?message, "Received message");

        let started = Instant::now();
        let result = self.dispatch(&message).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(()) => info!(
                topic = %topic,
                duration_ms = elapsed.as_millis() as u64,
                "Finished processing message"
            ),
            Err(e) => error!(topic = %topic, error = %e, "Failed to process message"),
        }

        telemetry::record_job_telemetry(topic, &result, elapsed);
        result
    }

    async fn dispatch(&self, message: &Message) -> Result<(), JobError> {
        let topic = message.topic();
        let handler = self
            .handlers
            .get(&topic)
            .ok_or(JobError::UnknownTopic(topic))?;

        let ctx = JobContext::with_timeout(self.job_timeout);
        let guarded = AssertUnwindSafe(handler.handle(&ctx, message)).catch_unwind();

        match tokio::time::timeout(self.job_timeout + self.cleanup_grace, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                error!(topic = %topic, panic = %reason, "Recovered from handler panic");
                Err(JobError::Panicked(reason))
            }
            Err(_) => {
                ctx.cancel();
                warn!(topic = %topic, "Handler ignored its deadline and was abandoned");
                Err(JobError::Timeout)
            }
        }
    }

    async fn heartbeat(&self) {
        match self.queue.len().await {
            Ok(len) => telemetry::record_worker_heartbeat(len),
            Err(e) => debug!(error = %e, "Failed to read queue length"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");

        let boxed: Box<dyn Any + Send> = Box::new(format!("session {}", 4));
        assert_eq!(panic_message(boxed.as_ref()), "session 4");

        let boxed: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
