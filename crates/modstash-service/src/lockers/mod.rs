//! Lock backend adapters.
//!
//! Each backend implements the small [`Locker`](crate::stash::Locker)
//! contract (plus, for the refresh-style backends, the holder's
//! acquire/refresh/release capability); all coordination logic lives in
//! [`crate::stash::locker`]. The concrete adapter is selected from
//! configuration at construction time.

use std::sync::Arc;

use crate::config::{LockBackendConfig, LockConfig};
use crate::stash::Locker;
use crate::stash::locker::LeaseTiming;

pub mod gcs;
pub mod memory;
pub mod postgres;
pub mod redis;

pub use gcs::GcsLocker;
pub use memory::MemoryLocker;
pub use postgres::PostgresLocker;
pub use redis::RedisLocker;

/// Constructs and validates the configured lock backend.
pub async fn create_locker(config: &LockConfig) -> anyhow::Result<Arc<dyn Locker>> {
    let timing = LeaseTiming::new(config.ping_interval, config.ttl);
    let acquire_timeout = config.acquire_timeout;

    let locker: Arc<dyn Locker> = match &config.backend {
        LockBackendConfig::Memory => Arc::new(MemoryLocker::new(acquire_timeout)),
        LockBackendConfig::Redis { url } => {
            Arc::new(RedisLocker::connect(url, timing, acquire_timeout).await?)
        }
        LockBackendConfig::Postgres { url } => {
            Arc::new(PostgresLocker::connect(url, timing, acquire_timeout).await?)
        }
        LockBackendConfig::Gcs {
            bucket,
            service_account_path,
        } => Arc::new(
            GcsLocker::new(
                bucket.clone(),
                service_account_path.as_deref(),
                timing,
                acquire_timeout,
            )
            .await?,
        ),
    };
    Ok(locker)
}
