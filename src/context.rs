//! Per-job deadline and cancellation.

use crate::error::JobError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Time budget of one job.
///
/// Every blocking call a handler makes goes through [`JobContext::run`], so
/// once the deadline passes outstanding I/O stops instead of running on in
/// the background. The context is independent of the worker's shutdown
/// signal: an in-flight job finishes or times out on its own schedule.
#[derive(Debug, Clone)]
pub struct JobContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Stops every operation running under this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fails fast once the context is cancelled or past its deadline.
    pub fn check(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            Err(JobError::Cancelled)
        } else if Instant::now() >= self.deadline {
            Err(JobError::Timeout)
        } else {
            Ok(())
        }
    }

    /// Runs `operation` under the deadline and cancellation of this context.
    pub async fn run<T, E, F>(&self, operation: F) -> Result<T, JobError>
    where
        F: Future<Output = Result<T, E>>,
        JobError: From<E>,
    {
        self.check()?;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(JobError::Cancelled),
            outcome = tokio::time::timeout_at(self.deadline, operation) => match outcome {
                Ok(result) => result.map_err(JobError::from),
                Err(_) => Err(JobError::Timeout),
            },
        }
    }
}
