//! In-process deduplication.
//!
//! Concurrent callers for the same key within one process share a single
//! underlying call and its result, without paying for a distributed lock.
//! Used standalone in single-process deployments, or layered underneath the
//! lock wrapper as a cheap local dedup in front of the network round trip.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::key::stash_key;
use super::{StashError, Stasher, Wrapper};

type StashResult = Result<String, StashError>;

/// Deduplicates concurrent identical stash calls within one process.
///
/// The subscriber map is scoped to this value, never global: independent
/// instances (one per process in production, one per test) cannot interfere.
pub struct SingleflightStasher {
    inner: Arc<dyn Stasher>,
    subs: Arc<Mutex<HashMap<String, Vec<oneshot::Sender<StashResult>>>>>,
}

/// Returns a wrapper adding in-process single-flight.
pub fn with_singleflight() -> Wrapper {
    Box::new(|inner| Arc::new(SingleflightStasher::new(inner)))
}

impl SingleflightStasher {
    pub fn new(inner: Arc<dyn Stasher>) -> Self {
        SingleflightStasher {
            inner,
            subs: Default::default(),
        }
    }
}

#[async_trait]
impl Stasher for SingleflightStasher {
    async fn stash(&self, module: &str, version: &str) -> Result<String, StashError> {
        let key = stash_key(module, version);
        let (tx, rx) = oneshot::channel();

        // The mutex guards the map only, never the work itself.
        let first = {
            let mut subs = self.subs.lock().unwrap();
            match subs.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().push(tx);
                    false
                }
                Entry::Vacant(entry) => {
                    entry.insert(vec![tx]);
                    true
                }
            }
        };

        if first {
            let inner = Arc::clone(&self.inner);
            let subs = Arc::clone(&self.subs);
            let module = module.to_owned();
            let version = version.to_owned();
            // The work runs detached: one subscriber giving up must not
            // cancel it for the others.
            tokio::spawn(async move {
                let result = inner.stash(&module, &version).await;
                // Remove the entry before notifying, so the next caller for
                // this key starts fresh work.
                let waiting = subs.lock().unwrap().remove(&key).unwrap_or_default();
                for tx in waiting {
                    let _ = tx.send(result.clone());
                }
            });
        } else {
            metric!(counter("stash.singleflight.coalesced") += 1);
        }

        rx.await.unwrap_or(Err(StashError::Canceled))
    }
}
