//! The stash pipeline.
//!
//! [`Stasher`] is the one operation this whole subsystem exists to implement
//! correctly under concurrency: take a (module, version), fetch it from
//! upstream and persist it. Everything around the base implementation is a
//! decorator with the same shape ("takes a stasher, returns a stasher"), so
//! deployments compose exactly the coordination they need:
//!
//! caller -> [event hook] -> [pool] -> [distributed lock] -> [single-flight] -> base

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod base;
pub mod event;
pub mod key;
pub mod locker;
pub mod pool;
pub mod singleflight;


pub use base::BaseStasher;
pub use event::with_events_hook;
pub use key::stash_key;
pub use locker::{LockedStasher, Locker, ReleaseSignal, with_locker};
pub use pool::with_pool;
pub use singleflight::with_singleflight;

/// An error from a stash operation, tagged with the operation that failed.
///
/// The enum is `Clone` (payloads are strings, not error sources) so that one
/// result can be broadcast to every caller coalesced onto a single execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StashError {
    /// The distributed lock could not be obtained within the allowed time.
    ///
    /// No work was started and no partial state exists.
    #[error("failed to acquire lock: {0}")]
    AcquireLock(String),
    /// The lock was lost while work was in flight.
    ///
    /// The stash may be incomplete; another holder may complete it later, so
    /// the whole operation is safe to retry.
    #[error("lock lost: {0}")]
    LockLost(String),
    /// The lock was given up before the work completed, with no recorded
    /// cause.
    #[error("lock was unexpectedly released")]
    UnexpectedRelease,
    /// The existence check against storage failed.
    #[error("existence check failed: {0}")]
    Checker(String),
    /// The upstream fetch failed.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// Persisting the fetched bundle failed.
    #[error("save failed: {0}")]
    Save(String),
    /// The fetch-and-save operation exceeded its overall deadline.
    #[error("stash timed out after {0:?}")]
    Timeout(Duration),
    /// Storage work succeeded but the post-hoc notification failed.
    ///
    /// Reported distinctly so a caller can treat the artifact as available
    /// and retry only the notification.
    #[error("event notification failed: {0}")]
    Notify(String),
    /// A background task carrying the work went away without a result.
    #[error("stash task was canceled")]
    Canceled,
}

impl StashError {
    pub(crate) fn fetch(err: anyhow::Error) -> Self {
        Self::Fetch(format!("{err:#}"))
    }

    pub(crate) fn save(err: anyhow::Error) -> Self {
        Self::Save(format!("{err:#}"))
    }

    pub(crate) fn checker(err: anyhow::Error) -> Self {
        Self::Checker(format!("{err:#}"))
    }

    pub(crate) fn notify(err: anyhow::Error) -> Self {
        Self::Notify(format!("{err:#}"))
    }
}

/// Takes a module from upstream and stashes it into storage.
#[async_trait]
pub trait Stasher: Send + Sync {
    /// Stashes the given module version and returns the resolved version.
    ///
    /// Cancellation is propagated by dropping the returned future; no lock or
    /// background task outlives the call unobserved.
    async fn stash(&self, module: &str, version: &str) -> Result<String, StashError>;
}

/// Extends a stasher with an addon.
pub type Wrapper = Box<dyn FnOnce(Arc<dyn Stasher>) -> Arc<dyn Stasher>>;

/// Applies `wrappers` to `base` in order, innermost first.
pub fn compose(base: Arc<dyn Stasher>, wrappers: Vec<Wrapper>) -> Arc<dyn Stasher> {
    wrappers
        .into_iter()
        .fold(base, |stasher, wrap| wrap(stasher))
}
