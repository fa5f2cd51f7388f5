use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::stash::base::DEFAULT_FETCH_TIMEOUT;
use crate::stash::locker::{DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_PING_INTERVAL};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the service.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: None,
            prefix: "modstash".to_owned(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Which distributed lock backend coordinates stashes across replicas.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LockBackendConfig {
    /// In-process only; correct for single-replica deployments.
    Memory,
    /// A lease under the stash key in redis.
    Redis { url: String },
    /// A postgres advisory lock.
    Postgres { url: String },
    /// A leased sentinel object in a Google Cloud Storage bucket.
    Gcs {
        bucket: String,
        /// Path to a service-account JSON file; ambient credentials are used
        /// when absent.
        #[serde(default)]
        service_account_path: Option<PathBuf>,
    },
}

impl Default for LockBackendConfig {
    fn default() -> Self {
        LockBackendConfig::Memory
    }
}

/// Distributed locking.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    #[serde(flatten)]
    pub backend: LockBackendConfig,
    /// Interval between lease renewals.
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Lease time-to-live. Defaults to twice the renewal interval, so one
    /// missed renewal is tolerated.
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,
    /// How long acquisition may wait for a lock held by someone else.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            backend: LockBackendConfig::default(),
            ping_interval: DEFAULT_PING_INTERVAL,
            ttl: None,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

/// The stash subsystem configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging.
    pub logging: Logging,

    /// Metrics.
    pub metrics: Metrics,

    /// The overall bound on one fetch-and-save operation.
    ///
    /// Long by default; module archives can be large.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Whether concurrent identical requests within this process share one
    /// execution before touching the distributed lock.
    pub single_flight: bool,

    /// Caps concurrent stash operations in this process. Unlimited when
    /// unset.
    pub pool_workers: Option<usize>,

    /// Distributed locking.
    pub lock: LockConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: Logging::default(),
            metrics: Metrics::default(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            single_flight: true,
            pool_workers: None,
            lock: LockConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let level = String::deserialize(deserializer)?;
    level.parse().map_err(de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::get(None).unwrap();
        assert!(config.single_flight);
        assert_eq!(config.pool_workers, None);
        assert_eq!(config.fetch_timeout, DEFAULT_FETCH_TIMEOUT);
        assert!(matches!(config.lock.backend, LockBackendConfig::Memory));
        assert_eq!(config.lock.ping_interval, DEFAULT_PING_INTERVAL);
        assert_eq!(config.lock.ttl, None);
    }

    #[test]
    fn test_parse_lock_backend() {
        let yaml = r#"
single_flight: false
pool_workers: 8
fetch_timeout: 5m
lock:
  type: redis
  url: redis://127.0.0.1:6379
  ping_interval: 3s
  ttl: 9s
  acquire_timeout: 30s
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.single_flight);
        assert_eq!(config.pool_workers, Some(8));
        assert_eq!(config.fetch_timeout, Duration::from_secs(5 * 60));
        assert!(matches!(
            config.lock.backend,
            LockBackendConfig::Redis { ref url } if url == "redis://127.0.0.1:6379"
        ));
        assert_eq!(config.lock.ping_interval, Duration::from_secs(3));
        assert_eq!(config.lock.ttl, Some(Duration::from_secs(9)));
        assert_eq!(config.lock.acquire_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_gcs_backend() {
        let yaml = r#"
lock:
  type: gcs
  bucket: my-proxy-locks
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.lock.backend,
            LockBackendConfig::Gcs { ref bucket, ref service_account_path }
                if bucket == "my-proxy-locks" && service_account_path.is_none()
        ));
    }
}
