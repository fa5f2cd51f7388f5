//! An in-process lock table.
//!
//! The backend for single-process deployments (no distributed coordination
//! configured) and the deterministic backend for wrapper tests. Mutual
//! exclusion holds only within the process, but the full lock protocol --
//! acquisition bounded by a timeout, release on cancellation, close-only
//! signal -- is identical to the networked backends.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::stash::locker::{DEFAULT_ACQUIRE_TIMEOUT, Locker, ReleaseSignal};
use crate::stash::StashError;

pub struct MemoryLocker {
    locks: Arc<Mutex<HashSet<String>>>,
    acquire_timeout: Duration,
}

impl MemoryLocker {
    pub fn new(acquire_timeout: Duration) -> Self {
        MemoryLocker {
            locks: Default::default(),
            acquire_timeout,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self, name: &str) -> bool {
        self.locks.lock().unwrap().contains(name)
    }
}

impl Default for MemoryLocker {
    fn default() -> Self {
        Self::new(DEFAULT_ACQUIRE_TIMEOUT)
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn lock(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<ReleaseSignal, StashError> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            {
                let mut locks = self.locks.lock().unwrap();
                if !locks.contains(name) {
                    locks.insert(name.to_owned());
                    break;
                }
            }
            if Instant::now() >= deadline {
                return Err(StashError::AcquireLock(format!(
                    "timed out waiting for lock {name}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let (tx, rx) = mpsc::channel(1);
        let locks = Arc::clone(&self.locks);
        let name = name.to_owned();
        tokio::spawn(async move {
            cancel.cancelled().await;
            locks.lock().unwrap().remove(&name);
            // An in-process lock cannot be lost; the channel always closes
            // without a value.
            drop(tx);
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_waits_for_release() {
        let locker = MemoryLocker::default();
        let first = CancellationToken::new();
        let mut first_signal = locker.lock("m@v", first.clone()).await.unwrap();

        // Held: a second attempt must not get through yet.
        let pending = locker.lock("m@v", CancellationToken::new());
        tokio::pin!(pending);
        let raced = tokio::time::timeout(Duration::from_millis(20), &mut pending).await;
        assert!(raced.is_err());

        first.cancel();
        assert_eq!(first_signal.recv().await, None);

        let second = pending.await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_times_out_while_held() {
        let locker = MemoryLocker::new(Duration::from_millis(20));
        let held = CancellationToken::new();
        let _signal = locker.lock("m@v", held.clone()).await.unwrap();

        let err = locker
            .lock("m@v", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StashError::AcquireLock(_)));
    }
}
