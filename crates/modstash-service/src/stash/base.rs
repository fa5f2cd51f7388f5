use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::fetch::{Fetcher, VersionBundle};
use crate::storage::Saver;

use super::{StashError, Stasher};

/// The default bound on one fetch-and-save operation.
///
/// Long on purpose: module archives can be large.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// The plain stasher: fetch from upstream, persist to storage.
///
/// No coordination and no retries happen here; failures surface immediately
/// and retry policy, if any, belongs to the layers above.
pub struct BaseStasher {
    fetcher: Arc<dyn Fetcher>,
    saver: Arc<dyn Saver>,
    fetch_timeout: Duration,
}

impl BaseStasher {
    pub fn new(fetcher: Arc<dyn Fetcher>, saver: Arc<dyn Saver>, fetch_timeout: Duration) -> Self {
        BaseStasher {
            fetcher,
            saver,
            fetch_timeout,
        }
    }
}

#[async_trait]
impl Stasher for BaseStasher {
    async fn stash(&self, module: &str, version: &str) -> Result<String, StashError> {
        let work = async {
            let bundle = self
                .fetcher
                .fetch(module, version)
                .await
                .map_err(StashError::fetch)?;
            let VersionBundle {
                info,
                mod_file,
                zip,
                version: resolved,
            } = bundle;

            // The archive stream is handed to the saver whole; it is consumed
            // there and dropped on every exit path. The bundle is persisted
            // under the resolved version, which is the key later existence
            // checks will see.
            self.saver
                .save(module, &resolved, mod_file, zip, info)
                .await
                .map_err(StashError::save)?;

            metric!(counter("stash.saved") += 1);
            Ok(resolved)
        };

        match tokio::time::timeout(self.fetch_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(StashError::Timeout(self.fetch_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::anyhow;

    use crate::fetch::ArchiveStream;

    use super::*;

    struct FixedFetcher {
        resolved: &'static str,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl Fetcher for FixedFetcher {
        async fn fetch(&self, _module: &str, _version: &str) -> anyhow::Result<VersionBundle> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(anyhow!("upstream unreachable"));
            }
            Ok(VersionBundle {
                info: b"{}".to_vec(),
                mod_file: b"module example.com/m".to_vec(),
                zip: Box::new(std::io::Cursor::new(b"zipbytes".to_vec())),
                version: self.resolved.to_owned(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSaver {
        saved: Mutex<Vec<(String, String, usize)>>,
    }

    #[async_trait]
    impl Saver for RecordingSaver {
        async fn save(
            &self,
            module: &str,
            version: &str,
            _mod_file: Vec<u8>,
            mut zip: ArchiveStream,
            _info: Vec<u8>,
        ) -> anyhow::Result<()> {
            let mut sink = Vec::new();
            tokio::io::copy(&mut zip, &mut sink).await?;
            self.saved
                .lock()
                .unwrap()
                .push((module.to_owned(), version.to_owned(), sink.len()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_saves_under_resolved_version() {
        let saver = Arc::new(RecordingSaver::default());
        let fetcher = Arc::new(FixedFetcher {
            resolved: "v1.0.0-20260101000000-abcdef123456",
            fail: false,
            delay: Duration::ZERO,
        });
        let stasher = BaseStasher::new(fetcher, Arc::clone(&saver) as _, DEFAULT_FETCH_TIMEOUT);

        let resolved = stasher.stash("example.com/m", "main").await.unwrap();

        assert_eq!(resolved, "v1.0.0-20260101000000-abcdef123456");
        let saved = saver.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, "example.com/m");
        assert_eq!(saved[0].1, "v1.0.0-20260101000000-abcdef123456");
        assert_eq!(saved[0].2, b"zipbytes".len());
    }

    #[tokio::test]
    async fn test_fetch_error_surfaces_without_save() {
        let saver = Arc::new(RecordingSaver::default());
        let fetcher = Arc::new(FixedFetcher {
            resolved: "v1.0.0",
            fail: true,
            delay: Duration::ZERO,
        });
        let stasher = BaseStasher::new(fetcher, Arc::clone(&saver) as _, DEFAULT_FETCH_TIMEOUT);

        let err = stasher.stash("example.com/m", "v1.0.0").await.unwrap_err();

        assert!(matches!(err, StashError::Fetch(_)));
        assert!(saver.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_fetch_times_out() {
        let saver = Arc::new(RecordingSaver::default());
        let fetcher = Arc::new(FixedFetcher {
            resolved: "v1.0.0",
            fail: false,
            delay: Duration::from_millis(100),
        });
        let timeout = Duration::from_millis(10);
        let stasher = BaseStasher::new(fetcher, saver, timeout);

        let err = stasher.stash("example.com/m", "v1.0.0").await.unwrap_err();

        assert_eq!(err, StashError::Timeout(timeout));
    }
}
