//! A lease-based K/V lock on redis.
//!
//! Acquisition writes a token under the key with `SET NX PX`; refresh and
//! release are compare-token scripts so a key that expired and was re-taken
//! by another holder is treated as lost, never silently stolen back.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::stash::StashError;
use crate::stash::locker::{HeldLock, LeaseTiming, Locker, ReleaseSignal, hold_lock};

const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Extends the lease only while the key still carries our token.
const REFRESH_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("pexpire", KEYS[1], ARGV[2])
else
  return 0
end"#;

/// Deletes the key only while it still carries our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("del", KEYS[1])
else
  return 0
end"#;

pub struct RedisLocker {
    conn: ConnectionManager,
    timing: LeaseTiming,
    acquire_timeout: Duration,
}

impl RedisLocker {
    /// Connects to the endpoint and pings it; a dead backend fails
    /// construction rather than the first stash.
    pub async fn connect(
        url: &str,
        timing: LeaseTiming,
        acquire_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(RedisLocker {
            conn,
            timing,
            acquire_timeout,
        })
    }
}

#[async_trait]
impl Locker for RedisLocker {
    async fn lock(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<ReleaseSignal, StashError> {
        let token = Uuid::new_v4().to_string();
        let ttl_ms = self.timing.ttl.as_millis() as u64;
        let deadline = Instant::now() + self.acquire_timeout;
        let mut conn = self.conn.clone();

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(name)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(|err| StashError::AcquireLock(err.to_string()))?;
            if acquired.is_some() {
                break;
            }
            if Instant::now() + ACQUIRE_RETRY_INTERVAL > deadline {
                return Err(StashError::AcquireLock(format!(
                    "timed out waiting for lock {name}"
                )));
            }
            tokio::time::sleep(ACQUIRE_RETRY_INTERVAL).await;
        }

        let held = RedisHeldLock {
            conn,
            name: name.to_owned(),
            token,
            ttl_ms,
        };
        Ok(hold_lock(Box::new(held), self.timing, cancel))
    }
}

struct RedisHeldLock {
    conn: ConnectionManager,
    name: String,
    token: String,
    ttl_ms: u64,
}

#[async_trait]
impl HeldLock for RedisHeldLock {
    async fn refresh(&mut self) -> Result<(), StashError> {
        let extended: i64 = Script::new(REFRESH_SCRIPT)
            .key(&self.name)
            .arg(&self.token)
            .arg(self.ttl_ms)
            .invoke_async(&mut self.conn)
            .await
            .map_err(|err| StashError::LockLost(err.to_string()))?;
        if extended == 0 {
            return Err(StashError::LockLost(format!(
                "lock {} is no longer held by this process",
                self.name
            )));
        }
        Ok(())
    }

    async fn release(mut self: Box<Self>) -> Result<(), StashError> {
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(&self.name)
            .arg(&self.token)
            .invoke_async(&mut self.conn)
            .await
            .map_err(|err| StashError::LockLost(err.to_string()))?;
        if deleted == 0 {
            // Expired or taken over; nothing of ours is left behind.
            tracing::warn!(key = %self.name, "lock was already gone at release");
        }
        Ok(())
    }
}
