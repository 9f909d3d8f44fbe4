//! Job queue over a shared list.
//!
//! Producers append to the tail, the single consumer blocks on the head, so
//! jobs are processed in arrival order. Delivery is at-most-once: an item is
//! removed from the list when it is popped, and nothing puts it back if the
//! handler later fails.

use crate::error::QueueError;
use crate::message::Message;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default queue name for worker jobs.
pub const DEFAULT_QUEUE_KEY: &str = "mcm:jobs";

/// Default time a single pop waits for work.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Queue: Send + Sync {
    /// Appends a message to the tail of the queue.
    async fn add(&self, message: &Message) -> Result<(), QueueError>;

    /// Removes and returns the message at the head of the queue.
    ///
    /// Blocks for up to the poll timeout waiting for work. The item leaves
    /// the queue as soon as it is popped; nothing puts it back if the
    /// caller later fails to process it.
    ///
    /// # Arguments
    ///
    /// * `shutdown` - Ends the wait early when cancelled
    ///
    /// # Returns
    ///
    /// * `Ok(Some(message))` - The next decoded message
    /// * `Ok(None)` - The wait timed out, or the popped item was malformed
    ///   (not UTF-8, bad envelope, unknown topic or bad payload) and was
    ///   logged and dropped
    /// * `Err(QueueError::Cancelled)` - `shutdown` fired
    /// * `Err(_)` - Transport error
    async fn pop(&self, shutdown: &CancellationToken) -> Result<Option<Message>, QueueError>;

    /// Returns the current queue length.
    async fn len(&self) -> Result<usize, QueueError>;
}

/// Redis-backed queue (`RPUSH` / `BLPOP`).
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    queue_key: String,
    poll_timeout: Duration,
}

impl RedisQueue {
    /// Creates a queue over `queue_key`.
    ///
    /// `BLPOP` holds the connection while it waits, so the connection should
    /// not be shared with latency-sensitive callers such as the lock manager.
    pub fn new(conn: ConnectionManager, queue_key: impl Into<String>, poll_timeout: Duration) -> Self {
        Self {
            conn,
            queue_key: queue_key.into(),
            poll_timeout,
        }
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn add(&self, message: &Message) -> Result<(), QueueError> {
        let json = message.encode()?;
        let mut conn = self.conn.clone();

        conn.rpush::<_, _, ()>(&self.queue_key, &json).await?;

        debug!(queue = %self.queue_key, topic = %message.topic(), "Enqueued message");
        Ok(())
    }

    async fn pop(&self, shutdown: &CancellationToken) -> Result<Option<Message>, QueueError> {
        let mut conn = self.conn.clone();

        // Raw bytes, so an item that is not UTF-8 is dropped like any other
        // malformed item instead of surfacing as a transport error.
        let popped: Option<(String, Vec<u8>)> = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(QueueError::Cancelled),
            result = conn.blpop::<_, Option<(String, Vec<u8>)>>(
                &self.queue_key,
                self.poll_timeout.as_secs_f64(),
            ) => result?,
        };

        Ok(popped.and_then(|(_key, raw)| Message::decode_bytes(&raw)))
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.queue_key).await?;
        Ok(len)
    }
}

/// In-process queue with the same codec and drop semantics as [`RedisQueue`].
pub struct MemoryQueue {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
    poll_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(poll_timeout: Duration) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            poll_timeout,
        }
    }

    /// Appends an undecoded item, as a misbehaving producer would.
    pub async fn push_raw(&self, raw: impl Into<String>) {
        self.items.lock().await.push_back(raw.into());
        self.notify.notify_one();
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_TIMEOUT)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn add(&self, message: &Message) -> Result<(), QueueError> {
        let json = message.encode()?;
        self.push_raw(json).await;
        Ok(())
    }

    async fn pop(&self, shutdown: &CancellationToken) -> Result<Option<Message>, QueueError> {
        let deadline = Instant::now() + self.poll_timeout;

        loop {
            if shutdown.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            let next = self.items.lock().await.pop_front();
            if let Some(raw) = next {
                return Ok(Message::decode(&raw));
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(QueueError::Cancelled),
                _ = self.notify.notified() => continue,
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.items.lock().await.len())
    }
}
