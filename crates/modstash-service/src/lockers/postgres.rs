//! An advisory lock on postgres.
//!
//! Each held lock pins one pooled connection: advisory locks are scoped to
//! the session, so the lock lives exactly as long as the connection does.
//! Refresh is a liveness probe on that connection; if the server dropped the
//! session, the lock is gone with it.

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, Postgres};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::stash::StashError;
use crate::stash::locker::{HeldLock, LeaseTiming, Locker, ReleaseSignal, hold_lock};

const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Advisory-lock keys are 64-bit integers; derive a stable one from the
/// stash key.
fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    i64::from_be_bytes(digest[..8].try_into().unwrap())
}

pub struct PostgresLocker {
    pool: PgPool,
    timing: LeaseTiming,
    acquire_timeout: Duration,
}

impl PostgresLocker {
    /// Connects to the database; a dead backend fails construction rather
    /// than the first stash.
    pub async fn connect(
        url: &str,
        timing: LeaseTiming,
        acquire_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new().max_connections(16).connect(url).await?;
        Ok(PostgresLocker {
            pool,
            timing,
            acquire_timeout,
        })
    }
}

#[async_trait]
impl Locker for PostgresLocker {
    async fn lock(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<ReleaseSignal, StashError> {
        let key = advisory_key(name);
        let deadline = Instant::now() + self.acquire_timeout;

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| StashError::AcquireLock(err.to_string()))?;

        loop {
            let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(&mut *conn)
                .await
                .map_err(|err| StashError::AcquireLock(err.to_string()))?;
            if locked {
                break;
            }
            if Instant::now() + ACQUIRE_RETRY_INTERVAL > deadline {
                return Err(StashError::AcquireLock(format!(
                    "timed out waiting for lock {name}"
                )));
            }
            tokio::time::sleep(ACQUIRE_RETRY_INTERVAL).await;
        }

        let held = PostgresHeldLock { conn, key };
        Ok(hold_lock(Box::new(held), self.timing, cancel))
    }
}

struct PostgresHeldLock {
    conn: PoolConnection<Postgres>,
    key: i64,
}

#[async_trait]
impl HeldLock for PostgresHeldLock {
    async fn refresh(&mut self) -> Result<(), StashError> {
        // The advisory lock lives and dies with this session. A failed probe
        // means the server may already have dropped the session, and the
        // lock with it.
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|err| StashError::LockLost(err.to_string()))?;
        Ok(())
    }

    async fn release(mut self: Box<Self>) -> Result<(), StashError> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|err| StashError::LockLost(err.to_string()))?;
        if !released {
            tracing::warn!(key = self.key, "advisory lock was not held at release");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advisory_key_is_stable() {
        let a = advisory_key("example.com/m@v1.0.0");
        let b = advisory_key("example.com/m@v1.0.0");
        assert_eq!(a, b);
        assert_ne!(a, advisory_key("example.com/m@v1.0.1"));
    }
}
