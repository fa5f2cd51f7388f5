//! A blob lease on Google Cloud Storage.
//!
//! A sentinel object under `locks/<key>` stands in for the lock. Acquisition
//! creates it with `ifGenerationMatch=0`, so exactly one writer wins; a
//! precondition failure means someone else holds it, which is retried with
//! backoff, bounded by the acquisition timeout. The object's content records
//! the lease expiry, so a sentinel left behind by a crashed holder can be
//! taken over once it has gone stale. Refresh rewrites the sentinel guarded
//! by its generation; a changed generation means the lease was taken over
//! and the lock is lost.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use gcp_auth::{CustomServiceAccount, Token, TokenProvider};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::stash::StashError;
use crate::stash::locker::{HeldLock, LeaseTiming, Locker, ReleaseSignal, hold_lock};

const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// The subset of the object resource the lock protocol needs.
#[derive(Debug, Deserialize)]
struct ObjectResource {
    generation: String,
}

impl ObjectResource {
    fn generation(&self) -> Result<i64, StashError> {
        self.generation
            .parse()
            .map_err(|_| StashError::AcquireLock("malformed object generation".into()))
    }
}

fn object_url(bucket: &str, object: &str) -> Result<Url, StashError> {
    let mut url = Url::parse("https://storage.googleapis.com/storage/v1")
        .map_err(|_| StashError::AcquireLock("failed to construct URL".into()))?;
    url.path_segments_mut()
        .map_err(|_| StashError::AcquireLock("failed to construct URL".into()))?
        .extend(&["b", bucket, "o", object]);
    Ok(url)
}

fn upload_url(bucket: &str) -> Result<Url, StashError> {
    let mut url = Url::parse("https://storage.googleapis.com/upload/storage/v1")
        .map_err(|_| StashError::AcquireLock("failed to construct URL".into()))?;
    url.path_segments_mut()
        .map_err(|_| StashError::AcquireLock("failed to construct URL".into()))?
        .extend(&["b", bucket, "o"]);
    Ok(url)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shared transport and credentials for the lock objects of one bucket.
struct GcsState {
    client: reqwest::Client,
    auth: Arc<dyn TokenProvider>,
    bucket: String,
}

impl GcsState {
    async fn token(&self) -> Result<Arc<Token>, StashError> {
        self.auth
            .token(&[STORAGE_SCOPE])
            .await
            .map_err(|err| StashError::AcquireLock(format!("gcs auth: {err}")))
    }

    /// Writes the sentinel guarded by `generation` (0 creates it) and returns
    /// the new generation, or `None` on a precondition failure.
    async fn write_sentinel(
        &self,
        object: &str,
        generation: i64,
        expires_at: u64,
    ) -> Result<Option<i64>, StashError> {
        let url = upload_url(&self.bucket)?;
        let response = self
            .client
            .post(url)
            .query(&[
                ("uploadType", "media"),
                ("name", object),
                ("ifGenerationMatch", &generation.to_string()),
            ])
            .bearer_auth(self.token().await?.as_str())
            .body(expires_at.to_string())
            .send()
            .await
            .map_err(|err| StashError::AcquireLock(format!("gcs upload: {err}")))?;

        match response.status() {
            StatusCode::PRECONDITION_FAILED => Ok(None),
            status if status.is_success() => {
                let resource: ObjectResource = response
                    .json()
                    .await
                    .map_err(|err| StashError::AcquireLock(format!("gcs upload: {err}")))?;
                Ok(Some(resource.generation()?))
            }
            status => Err(StashError::AcquireLock(format!(
                "gcs upload returned {status}"
            ))),
        }
    }

    /// Reads the current sentinel, returning its generation and recorded
    /// expiry, or `None` if it no longer exists.
    async fn read_sentinel(&self, object: &str) -> Result<Option<(i64, u64)>, StashError> {
        let url = object_url(&self.bucket, object)?;
        let token = self.token().await?;

        let response = self
            .client
            .get(url.clone())
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(|err| StashError::AcquireLock(format!("gcs metadata: {err}")))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StashError::AcquireLock(format!(
                "gcs metadata returned {}",
                response.status()
            )));
        }
        let resource: ObjectResource = response
            .json()
            .await
            .map_err(|err| StashError::AcquireLock(format!("gcs metadata: {err}")))?;
        let generation = resource.generation()?;

        let response = self
            .client
            .get(url)
            .query(&[("alt", "media")])
            .bearer_auth(token.as_str())
            .send()
            .await
            .map_err(|err| StashError::AcquireLock(format!("gcs read: {err}")))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response
            .text()
            .await
            .map_err(|err| StashError::AcquireLock(format!("gcs read: {err}")))?;
        // An unreadable expiry is treated as a live lease; it will still be
        // waited out via the acquisition timeout.
        let expires_at = body.trim().parse().unwrap_or(u64::MAX);
        Ok(Some((generation, expires_at)))
    }

    /// Deletes the sentinel guarded by `generation`. Losing the race to
    /// another writer is not an error.
    async fn delete_sentinel(&self, object: &str, generation: i64) -> Result<(), StashError> {
        let url = object_url(&self.bucket, object)?;
        let response = self
            .client
            .delete(url)
            .query(&[("ifGenerationMatch", &generation.to_string())])
            .bearer_auth(self.token().await?.as_str())
            .send()
            .await
            .map_err(|err| StashError::LockLost(format!("gcs delete: {err}")))?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::PRECONDITION_FAILED => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(StashError::LockLost(format!(
                "gcs delete returned {status}"
            ))),
        }
    }
}

pub struct GcsLocker {
    state: Arc<GcsState>,
    timing: LeaseTiming,
    acquire_timeout: Duration,
}

impl GcsLocker {
    /// Sets up credentials for the given bucket. With no service-account
    /// file, ambient credentials (workload identity, gcloud) are used.
    pub async fn new(
        bucket: String,
        service_account_path: Option<&Path>,
        timing: LeaseTiming,
        acquire_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let auth: Arc<dyn TokenProvider> = match service_account_path {
            Some(path) => Arc::new(CustomServiceAccount::from_file(path)?),
            None => gcp_auth::provider().await?,
        };
        Ok(GcsLocker {
            state: Arc::new(GcsState {
                client: reqwest::Client::new(),
                auth,
                bucket,
            }),
            timing,
            acquire_timeout,
        })
    }
}

#[async_trait]
impl Locker for GcsLocker {
    async fn lock(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<ReleaseSignal, StashError> {
        let object = format!("locks/{name}");
        let deadline = Instant::now() + self.acquire_timeout;

        let generation = loop {
            // Checked on every iteration: takeover churn (delete a stale
            // sentinel, lose the re-create race, repeat) must be bounded too.
            if Instant::now() > deadline {
                return Err(StashError::AcquireLock(format!(
                    "timed out waiting for lock {name}"
                )));
            }

            let expires_at = now_millis() + self.timing.ttl.as_millis() as u64;
            if let Some(generation) = self.state.write_sentinel(&object, 0, expires_at).await? {
                break generation;
            }

            // Someone holds it. A sentinel whose recorded expiry has passed
            // was left behind by a crashed holder and can be taken over.
            if let Some((generation, expires_at)) = self.state.read_sentinel(&object).await? {
                if now_millis() > expires_at {
                    let _ = self.state.delete_sentinel(&object, generation).await;
                    continue;
                }
            } else {
                // Released between our attempt and the read; try again now.
                continue;
            }

            tokio::time::sleep(ACQUIRE_RETRY_INTERVAL).await;
        };

        let held = GcsHeldLock {
            state: Arc::clone(&self.state),
            object,
            generation,
            ttl: self.timing.ttl,
        };
        Ok(hold_lock(Box::new(held), self.timing, cancel))
    }
}

struct GcsHeldLock {
    state: Arc<GcsState>,
    object: String,
    generation: i64,
    ttl: Duration,
}

#[async_trait]
impl HeldLock for GcsHeldLock {
    async fn refresh(&mut self) -> Result<(), StashError> {
        let expires_at = now_millis() + self.ttl.as_millis() as u64;
        match self
            .state
            .write_sentinel(&self.object, self.generation, expires_at)
            .await
        {
            Ok(Some(generation)) => {
                self.generation = generation;
                Ok(())
            }
            Ok(None) => Err(StashError::LockLost(format!(
                "lease object {} was taken over",
                self.object
            ))),
            Err(StashError::AcquireLock(msg)) => Err(StashError::LockLost(msg)),
            Err(err) => Err(err),
        }
    }

    async fn release(self: Box<Self>) -> Result<(), StashError> {
        self.state
            .delete_sentinel(&self.object, self.generation)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_encodes_key() {
        let url = object_url("bucket", "locks/example.com/m@v1.0.0").unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/bucket/o/locks%2Fexample.com%2Fm@v1.0.0"
        );
    }
}
