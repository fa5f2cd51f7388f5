//! Distributed single-flight.
//!
//! A [`Locker`] hands out named, time-bounded locks; [`LockedStasher`] uses
//! them to guarantee that at most one process in a fleet performs the
//! fetch-and-save for a given key, re-checking storage after acquisition so
//! work finished by another replica while we waited becomes a no-op.
//!
//! Backends that renew a lease explicitly implement the small [`HeldLock`]
//! capability and share one holder task, [`hold_lock`], which owns the whole
//! tick / refresh / release lifecycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::storage::Checker;

use super::key::stash_key;
use super::{StashError, Stasher, Wrapper};

/// How often a held lease is renewed.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// How long acquisition may retry before giving up.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Signals that a lock has been given up.
///
/// A clean release (in response to cancellation) closes the channel without a
/// value. A lock lost unexpectedly sends exactly one error, then the channel
/// closes. Never more than one value is sent.
pub type ReleaseSignal = mpsc::Receiver<StashError>;

/// A distributed lock backend.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Acquires the named lock and holds it until `cancel` is triggered.
    ///
    /// An `Err` means no lock was acquired and nothing was left running.
    /// Otherwise a background task owns the lock and reports on the returned
    /// [`ReleaseSignal`] once it is gone. "Already held by someone else" is
    /// retried internally, bounded by the backend's acquisition timeout.
    async fn lock(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<ReleaseSignal, StashError>;
}

/// A lock a backend currently holds, as driven by [`hold_lock`].
#[async_trait]
pub(crate) trait HeldLock: Send {
    /// Re-asserts the lock with the backend, extending its lease.
    ///
    /// An error means the lock must be presumed lost.
    async fn refresh(&mut self) -> Result<(), StashError>;

    /// Gives the lock up. Called exactly once.
    async fn release(self: Box<Self>) -> Result<(), StashError>;
}

/// Lease timing shared by the refresh-style backends.
#[derive(Clone, Copy, Debug)]
pub struct LeaseTiming {
    /// Interval between renewals.
    pub ping_interval: Duration,
    /// Lease time-to-live. Longer than the interval so that a single missed
    /// renewal does not cause loss.
    pub ttl: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        LeaseTiming {
            ping_interval: DEFAULT_PING_INTERVAL,
            ttl: DEFAULT_PING_INTERVAL * 2,
        }
    }
}

impl LeaseTiming {
    pub fn new(ping_interval: Duration, ttl: Option<Duration>) -> Self {
        let ping_interval = if ping_interval.is_zero() {
            DEFAULT_PING_INTERVAL
        } else {
            ping_interval
        };
        let ttl = ttl.filter(|ttl| !ttl.is_zero()).unwrap_or(ping_interval * 2);
        LeaseTiming { ping_interval, ttl }
    }
}

/// Spawns the task that keeps `held` alive and releases it when `cancel`
/// fires or a renewal fails.
pub(crate) fn hold_lock(
    held: Box<dyn HeldLock>,
    timing: LeaseTiming,
    cancel: CancellationToken,
) -> ReleaseSignal {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(hold_and_release(held, timing, cancel, tx));
    rx
}

async fn hold_and_release(
    mut held: Box<dyn HeldLock>,
    timing: LeaseTiming,
    cancel: CancellationToken,
    tx: mpsc::Sender<StashError>,
) {
    let mut expiry = Instant::now() + timing.ttl;
    let mut ticker = tokio::time::interval_at(Instant::now() + timing.ping_interval, timing.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut refresh_err = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match held.refresh().await {
                Ok(()) => expiry = Instant::now() + timing.ttl,
                Err(err) => {
                    refresh_err = Some(err);
                    break;
                }
            },
        }
    }

    if let Err(err) = held.release().await {
        // The backend may still show the lock as held. Do not report it free
        // before its lease would have run out on its own, or a second
        // acquirer could proceed while the backend still observes this one.
        tracing::error!(error = %err, "failed to release lock");
        tokio::time::sleep_until(expiry).await;
    }

    if let Some(err) = refresh_err {
        metric!(counter("stash.lock.lost") += 1);
        tracing::error!(error = %err, "lock lost while held");
        let _ = tx.send(err).await;
    }
    // Dropping the sender closes the channel: the clean-release signal.
}

/// Wraps a stasher with distributed mutual exclusion keyed by module@version.
pub struct LockedStasher {
    locker: Arc<dyn Locker>,
    checker: Arc<dyn Checker>,
    inner: Arc<dyn Stasher>,
}

impl LockedStasher {
    pub fn new(
        locker: Arc<dyn Locker>,
        checker: Arc<dyn Checker>,
        inner: Arc<dyn Stasher>,
    ) -> Self {
        LockedStasher {
            locker,
            checker,
            inner,
        }
    }
}

/// Returns a wrapper adding lock-based single-flight across processes.
pub fn with_locker(locker: Arc<dyn Locker>, checker: Arc<dyn Checker>) -> Wrapper {
    Box::new(move |inner| Arc::new(LockedStasher::new(locker, checker, inner)))
}

#[async_trait]
impl Stasher for LockedStasher {
    async fn stash(&self, module: &str, version: &str) -> Result<String, StashError> {
        metric!(counter("stash.access") += 1);
        let name = stash_key(module, version);

        let cancel = CancellationToken::new();
        // The holder must be told to release even if this future is dropped
        // mid-call.
        let _guard = cancel.clone().drop_guard();

        let mut release = self.locker.lock(&name, cancel.clone()).await?;
        metric!(counter("stash.lock.acquired") += 1);
        tracing::debug!(key = %name, "acquired stash lock");

        // The existence check happens strictly after acquisition: another
        // process may have finished this exact work while we waited.
        let work = async {
            let exists = self
                .checker
                .exists(module, version)
                .await
                .map_err(StashError::checker)?;
            if exists {
                metric!(counter("stash.already_present") += 1);
                return Ok(version.to_owned());
            }
            self.inner.stash(module, version).await
        };
        tokio::pin!(work);

        let result = tokio::select! {
            res = &mut work => res,
            lost = release.recv() => {
                // The lock is gone. Dropping `work` here aborts whatever I/O
                // the check or the delegate had in flight.
                Err(lost.unwrap_or(StashError::UnexpectedRelease))
            }
        };

        // Release ordering: work settled, then explicit cancel, then wait for
        // the holder to finish releasing. The lock is observably free by the
        // time this call returns.
        cancel.cancel();
        while release.recv().await.is_some() {}

        result
    }
}
