//! Distributed mutual exclusion with TTL-bound locks.
//!
//! A lock is a marker stored under its key together with a random owner
//! token. Acquisition only succeeds when no live marker exists; release only
//! deletes the marker when the token still matches, so an owner whose lock
//! expired can never drop somebody else's.

use crate::error::LockError;
use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Compare-and-delete, so only the owner can release.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub ttl: Duration,
    /// Total acquisition attempts, including the first.
    pub tries: u32,
    pub retry_delay_min: Duration,
    pub retry_delay_max: Duration,
}

impl LockOptions {
    pub fn new(ttl: Duration, tries: u32) -> Self {
        Self {
            ttl,
            tries,
            retry_delay_min: Duration::from_millis(50),
            retry_delay_max: Duration::from_millis(250),
        }
    }

    fn retry_delay(&self) -> Duration {
        let min = self.retry_delay_min.as_millis() as u64;
        let max = (self.retry_delay_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Proof of ownership returned by [`LockManager::acquire`].
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    token: String,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Stores `token` under `key` for `ttl` unless a live marker exists.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Deletes the marker under `key` if it still carries `token`.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, LockError>;

    /// Acquires `key`, retrying with jittered backoff up to `options.tries` attempts.
    async fn acquire(&self, key: &str, options: LockOptions) -> Result<LockHandle, LockError> {
        let token = Uuid::new_v4().to_string();
        let tries = options.tries.max(1);

        for attempt in 1..=tries {
            if self.try_lock(key, &token, options.ttl).await? {
                debug!(key = %key, attempt, "Lock acquired");
                return Ok(LockHandle {
                    key: key.to_string(),
                    token,
                });
            }
            if attempt < tries {
                let delay = options.retry_delay();
                tokio::time::sleep(delay).await;
            }
        }

        Err(LockError::AlreadyLocked {
            key: key.to_string(),
            tries,
        })
    }

    async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        if self.unlock(&handle.key, &handle.token).await? {
            debug!(key = %handle.key, "Lock released");
            Ok(())
        } else {
            Err(LockError::NotHeld { key: handle.key })
        }
    }
}

/// Redis-backed locks (`SET NX PX` plus a compare-and-delete script).
#[derive(Clone)]
pub struct RedisLockManager {
    conn: ConnectionManager,
    unlock_script: redis::Script,
}

impl RedisLockManager {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            unlock_script: redis::Script::new(UNLOCK_SCRIPT),
        }
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .unlock_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }
}

/// Process-local locks with the same TTL semantics as [`RedisLockManager`].
#[derive(Default)]
pub struct MemoryLockManager {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a live marker exists under `key`.
    pub async fn is_locked(&self, key: &str) -> bool {
        let entries = self.entries.lock().await;
        matches!(entries.get(key), Some((_, expires_at)) if *expires_at > Instant::now())
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }

        entries.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some((owner, expires_at)) if owner == token => {
                let live = *expires_at > Instant::now();
                entries.remove(key);
                Ok(live)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "session:1:export-asset-lock";

    fn quick(ttl: Duration, tries: u32) -> LockOptions {
        LockOptions {
            retry_delay_min: Duration::from_millis(1),
            retry_delay_max: Duration::from_millis(5),
            ..LockOptions::new(ttl, tries)
        }
    }

    #[tokio::test]
    async fn test_second_acquire_is_refused() {
        let locks = MemoryLockManager::new();
        let _held = locks.acquire(KEY, quick(Duration::from_secs(60), 2)).await.unwrap();

        let err = locks
            .acquire(KEY, quick(Duration::from_secs(60), 2))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::AlreadyLocked { tries: 2, .. }));
    }

    #[tokio::test]
    async fn test_release_allows_reacquire() {
        let locks = MemoryLockManager::new();
        let handle = locks.acquire(KEY, quick(Duration::from_secs(60), 1)).await.unwrap();
        assert_eq!(handle.key(), KEY);
        assert!(locks.is_locked(KEY).await);

        locks.release(handle).await.unwrap();
        assert!(!locks.is_locked(KEY).await);

        locks.acquire(KEY, quick(Duration::from_secs(60), 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let locks = MemoryLockManager::new();
        let _stale = locks.acquire(KEY, quick(Duration::from_millis(10), 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        locks.acquire(KEY, quick(Duration::from_secs(60), 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_owner_cannot_release_new_owner() {
        let locks = MemoryLockManager::new();
        let stale = locks.acquire(KEY, quick(Duration::from_millis(10), 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _current = locks.acquire(KEY, quick(Duration::from_secs(60), 1)).await.unwrap();

        let err = locks.release(stale).await.unwrap_err();
        assert!(matches!(err, LockError::NotHeld { .. }));
        assert!(locks.is_locked(KEY).await);
    }

    #[tokio::test]
    async fn test_zero_tries_still_attempts_once() {
        let locks = MemoryLockManager::new();
        locks.acquire(KEY, quick(Duration::from_secs(60), 0)).await.unwrap();
    }

    // Note: requires a running Redis instance on localhost:6379.
    #[tokio::test]
    #[ignore]
    async fn test_redis_lock_round_trip() {
        let client = redis::Client::open("redis://127.0.0.1/").unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        let locks = RedisLockManager::new(conn);
        let key = "session:test:export-asset-lock";

        let handle = locks.acquire(key, quick(Duration::from_secs(5), 1)).await.unwrap();
        let err = locks.acquire(key, quick(Duration::from_secs(5), 2)).await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyLocked { .. }));

        locks.release(handle).await.unwrap();
        let handle = locks.acquire(key, quick(Duration::from_secs(5), 1)).await.unwrap();
        locks.release(handle).await.unwrap();
    }
}
