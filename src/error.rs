//! Error types shared by the queue, lock manager and job handlers.

use crate::message::Topic;
use thiserror::Error;

/// Errors raised by [`crate::queue::Queue`] implementations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The caller's shutdown token fired while waiting for work.
    #[error("queue wait cancelled")]
    Cancelled,

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("queue transport error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Errors raised by [`crate::lock::LockManager`] implementations.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another owner holds the lock and every attempt was refused.
    #[error("lock {key} is already held (gave up after {tries} attempts)")]
    AlreadyLocked { key: String, tries: u32 },

    /// Release was called for a lock that expired or changed owner.
    #[error("lock {key} is no longer held by this owner")]
    NotHeld { key: String },

    #[error("lock store error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Outcome of a failed job, as logged by the dispatch loop.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown topic {0}")]
    UnknownTopic(Topic),

    #[error("handler for {expected} received a {actual} message")]
    UnexpectedPayload { expected: Topic, actual: Topic },

    #[error("job exceeded its deadline")]
    Timeout,

    #[error("job cancelled")]
    Cancelled,

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("invalid staging entry: {0}")]
    InvalidEntry(String),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl JobError {
    /// True when the job was refused because another worker holds its lock.
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, JobError::Lock(LockError::AlreadyLocked { .. }))
    }

    /// True for deadline expiry and cancellation, which handlers must not swallow.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, JobError::Timeout | JobError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_contention_is_distinct() {
        let contention = JobError::from(LockError::AlreadyLocked {
            key: "session:1:export-asset-lock".to_string(),
            tries: 2,
        });
        assert!(contention.is_lock_contention());
        assert!(!contention.is_interrupt());

        let not_held = JobError::from(LockError::NotHeld {
            key: "session:1:export-asset-lock".to_string(),
        });
        assert!(!not_held.is_lock_contention());
    }

    #[test]
    fn test_interrupts() {
        assert!(JobError::Timeout.is_interrupt());
        assert!(JobError::Cancelled.is_interrupt());
        assert!(!JobError::Panicked("boom".to_string()).is_interrupt());
    }
}
