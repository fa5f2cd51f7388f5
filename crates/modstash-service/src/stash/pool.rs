//! A ceiling on concurrent stash work.
//!
//! A fixed set of workers drains jobs from a single channel, so a process
//! never runs more than `workers` inner stash operations at once no matter
//! how many callers are queued. Callers trade latency for a resource ceiling
//! (disk, memory, outbound connections to upstream).

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc, oneshot};

use super::{StashError, Stasher, Wrapper};

type Job = BoxFuture<'static, ()>;

/// Runs inner stash operations `workers` at a time.
pub struct PoolStasher {
    inner: Arc<dyn Stasher>,
    jobs: mpsc::Sender<Job>,
}

/// Returns a wrapper bounding concurrent stash operations.
pub fn with_pool(workers: usize) -> Wrapper {
    Box::new(move |inner| Arc::new(PoolStasher::new(inner, workers)))
}

impl PoolStasher {
    /// Spawns the worker tasks; must be called from within a runtime.
    pub fn new(inner: Arc<dyn Stasher>, workers: usize) -> Self {
        let (jobs, rx) = mpsc::channel::<Job>(1);
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    // Hold the receiver lock only while picking a job up, not
                    // while running it.
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
            });
        }
        PoolStasher { inner, jobs }
    }
}

#[async_trait]
impl Stasher for PoolStasher {
    async fn stash(&self, module: &str, version: &str) -> Result<String, StashError> {
        let (done_tx, done_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let module = module.to_owned();
        let version = version.to_owned();

        let job = async move {
            let _ = done_tx.send(inner.stash(&module, &version).await);
        }
        .boxed();

        // Blocks until a worker is free to take the job.
        self.jobs
            .send(job)
            .await
            .map_err(|_| StashError::Canceled)?;

        done_rx.await.unwrap_or(Err(StashError::Canceled))
    }
}
