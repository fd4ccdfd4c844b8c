use std::fs;
use std::num::NonZeroUsize;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::ConfigError;

/// Engine settings.
///
/// Usually built in code with [`Config::new`] and the setters, or read from
/// a JSON file:
///
/// ```json
/// { "cache_dir": "/data/cache", "jobs": 4, "timeout": 3600, "lock": true }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root of the on-disk output cache.
    pub cache_dir: Utf8PathBuf,
    /// Number of operators allowed to run at the same time.
    pub jobs: NonZeroUsize,
    /// Deadline for a whole execution, in seconds.
    #[serde(with = "seconds")]
    pub timeout: Option<Duration>,
    /// Take per-fingerprint file locks while building.
    pub lock: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: Utf8PathBuf::from(".cache"),
            jobs: std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            timeout: None,
            lock: true,
        }
    }
}

impl Config {
    pub fn new(cache_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_owned(), e))
    }

    /// Sets the worker count. Zero is treated as one.
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = NonZeroUsize::new(jobs).unwrap_or(NonZeroUsize::MIN);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn lock(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;

        secs.map(|secs| {
            Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}
