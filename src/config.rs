//! Configuration types for the download engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`StorageConfig::root`].
pub const ROOT_ENV_VAR: &str = "RESUMABLE_DL_ROOT";

/// A pair of hosts serving identical content.
///
/// When an asset URL points at `primary`, odd-numbered segments are fetched
/// from the same URL with the host swapped for `alternate` (and vice versa).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRule {
    /// Host of the first origin.
    pub primary: String,
    /// Host of the second origin.
    pub alternate: String,
}

/// Tunables for the segmented download engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Segment size in bytes.
    pub chunk_size: u64,
    /// Maximum in-flight fetches per asset.
    pub max_concurrent_segments: usize,
    /// Retries allowed per segment after its first failure.
    pub max_retries_per_segment: u32,
    /// Delay before a failed segment is retried, in milliseconds.
    pub retry_delay_ms: u64,
    /// Timeout for each probe and fetch request, in seconds.
    pub request_timeout_secs: u64,
    /// Host pairs used for origin alternation.
    pub mirrors: Vec<MirrorRule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500 * 1024,
            max_concurrent_segments: 5,
            max_retries_per_segment: 5,
            retry_delay_ms: 2_000,
            request_timeout_secs: 30,
            mirrors: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the segment size in bytes.
    #[must_use]
    pub const fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Sets the per-asset concurrency limit.
    #[must_use]
    pub const fn with_max_concurrent_segments(mut self, limit: usize) -> Self {
        self.max_concurrent_segments = limit;
        self
    }

    /// Sets the per-segment retry budget.
    #[must_use]
    pub const fn with_max_retries_per_segment(mut self, retries: u32) -> Self {
        self.max_retries_per_segment = retries;
        self
    }

    /// Sets the retry delay.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs();
        self
    }

    /// Adds a mirror host pair.
    #[must_use]
    pub fn with_mirror(mut self, primary: impl Into<String>, alternate: impl Into<String>) -> Self {
        self.mirrors.push(MirrorRule {
            primary: primary.into(),
            alternate: alternate.into(),
        });
        self
    }

    /// Retry delay as a [`Duration`].
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Where segments, metadata and finished files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the on-disk layout.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = std::env::var(ROOT_ENV_VAR).map_or_else(
            |_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("resumable-dl")
            },
            PathBuf::from,
        );
        Self { root }
    }
}

impl StorageConfig {
    /// Uses `root` as the storage root.
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Engine tunables.
    pub engine: EngineConfig,
    /// Storage location.
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default location of the config file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("resumable-dl")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Loads configuration from `path`, or defaults if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }
}
