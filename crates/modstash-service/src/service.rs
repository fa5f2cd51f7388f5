//! Assembly of the stash pipeline from configuration.

use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::events::EventHook;
use crate::fetch::Fetcher;
use crate::lockers;
use crate::stash::{
    BaseStasher, Stasher, Wrapper, compose, with_events_hook, with_locker, with_pool,
    with_singleflight,
};
use crate::storage::{Checker, Saver};

/// Builds the stash pipeline described by `config`.
///
/// Wrapper order, innermost out: base stasher, in-process single-flight (if
/// enabled), distributed lock (the in-memory backend when none is
/// configured, so the exists-after-acquire re-check always runs), bounded
/// pool (if configured), event hook (if provided).
///
/// Deployments needing a different order can assemble one directly with
/// [`compose`].
pub async fn create_stasher(
    config: &Config,
    fetcher: Arc<dyn Fetcher>,
    saver: Arc<dyn Saver>,
    checker: Arc<dyn Checker>,
    hook: Option<Arc<dyn EventHook>>,
) -> Result<Arc<dyn Stasher>> {
    let base: Arc<dyn Stasher> = Arc::new(BaseStasher::new(fetcher, saver, config.fetch_timeout));

    let mut wrappers: Vec<Wrapper> = Vec::new();
    if config.single_flight {
        wrappers.push(with_singleflight());
    }

    let locker = lockers::create_locker(&config.lock).await?;
    wrappers.push(with_locker(locker, checker));

    if let Some(workers) = config.pool_workers {
        wrappers.push(with_pool(workers));
    }
    if let Some(hook) = hook {
        wrappers.push(with_events_hook(hook));
    }

    Ok(compose(base, wrappers))
}
