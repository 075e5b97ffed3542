//! Pool configuration
//!
//! Configuration is read from a TOML file and then overridden from the
//! environment:
//!
//! ```toml
//! [repository]
//! total_space = 1073741824
//! notification = "ordered"
//! abort_policy = "mark_broken"
//! sticky_sweep_interval = 1000     # milliseconds
//! store = { kind = "local_fs", path = "/var/pool/data" }
//!
//! [repository.checksum]
//! types = ["crc32"]
//! on_write = true
//!
//! [nearline]
//! max_active_removes = 8
//! remove_timeout = 300             # seconds
//!
//! [[nearline.hsm]]
//! instance = "osm"
//! type = "osm"
//! attributes = { command = "/usr/share/pool/hsm.sh" }
//!
//! [logging]
//! filter = "info"
//! format = "text"
//! ```
//!
//! ## Environment overrides
//! - `POOL_TOTAL_SPACE`: pool size in bytes
//! - `POOL_DATA_PATH`: store replicas under this directory
//! - `POOL_NOTIFICATION`: `ordered` or `sync`
//! - `POOL_REMOVE_TIMEOUT_SECS`: per-command removal timeout
//! - `POOL_MAX_ACTIVE_REMOVES`: concurrent removal commands
//! - `POOL_LOG_FORMAT`: `text` or `json`
//! - `RUST_LOG`: log filter

use crate::nearline::hsm::HsmConfig;
use crate::repository::checksum::ChecksumType;
use crate::repository::notifier::NotificationMode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error loading or validating configuration
#[derive(Debug)]
pub enum ConfigError {
    /// Config file could not be read
    Io(std::io::Error),
    /// Config file or environment value could not be parsed
    Parse(String),
    /// Values parsed but are inconsistent
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config: {}", e),
            ConfigError::Parse(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

// ============================================================================
// Repository
// ============================================================================

/// What happens to a replica whose write handle closes without commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortPolicy {
    /// Keep the partial data and flag the replica broken
    #[default]
    MarkBroken,
    /// Remove and destroy the replica
    Delete,
}

/// Which checksums the pool computes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksumPolicy {
    /// Digest types computed on write and by the checksum scan
    pub types: Vec<ChecksumType>,
    /// Compute checksums while data is written
    pub on_write: bool,
}

impl Default for ChecksumPolicy {
    fn default() -> Self {
        ChecksumPolicy {
            types: vec![ChecksumType::Crc32],
            on_write: true,
        }
    }
}

/// Where replica bytes live
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    InMemory,
    LocalFs { path: PathBuf },
}

/// Configuration of the replica repository
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Pool size in bytes
    pub total_space: u64,
    /// Space to keep free; `None` derives it from the pool size
    pub gap: Option<u64>,
    pub notification: NotificationMode,
    pub abort_policy: AbortPolicy,
    pub checksum: ChecksumPolicy,
    /// How often lapsed pins are swept (default: 1s)
    #[serde(with = "duration_millis")]
    pub sticky_sweep_interval: Duration,
    pub store: StoreConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        RepositoryConfig {
            total_space: 1024 * 1024 * 1024, // 1GB
            gap: None,
            notification: NotificationMode::Ordered,
            abort_policy: AbortPolicy::MarkBroken,
            checksum: ChecksumPolicy::default(),
            sticky_sweep_interval: Duration::from_secs(1),
            store: StoreConfig::InMemory,
        }
    }
}

impl RepositoryConfig {
    /// Configuration for testing: in-memory, synchronous delivery, no
    /// checksum computation
    pub fn test(total_space: u64) -> Self {
        RepositoryConfig {
            total_space,
            gap: None,
            notification: NotificationMode::Synchronous,
            abort_policy: AbortPolicy::MarkBroken,
            checksum: ChecksumPolicy {
                types: Vec::new(),
                on_write: false,
            },
            sticky_sweep_interval: Duration::from_millis(100),
            store: StoreConfig::InMemory,
        }
    }
}

// ============================================================================
// Nearline
// ============================================================================

/// Configuration of nearline (HSM) interaction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NearlineConfig {
    /// Removal commands running at once
    pub max_active_removes: usize,
    /// Per-command removal timeout (default: 300s)
    #[serde(with = "duration_secs")]
    pub remove_timeout: Duration,
    /// Configured HSM backends
    pub hsm: Vec<HsmConfig>,
}

impl Default for NearlineConfig {
    fn default() -> Self {
        NearlineConfig {
            max_active_removes: 8,
            remove_timeout: Duration::from_secs(300),
            hsm: Vec::new(),
        }
    }
}

impl NearlineConfig {
    pub fn test() -> Self {
        NearlineConfig {
            max_active_removes: 4,
            remove_timeout: Duration::from_secs(5),
            hsm: Vec::new(),
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ============================================================================
// PoolConfig
// ============================================================================

/// Top-level configuration of one pool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub repository: RepositoryConfig,
    pub nearline: NearlineConfig,
    pub logging: LoggingConfig,
}

impl PoolConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: PoolConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Load from `path` if given, else defaults; then apply the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Apply overrides from process environment variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("POOL_TOTAL_SPACE") {
            self.repository.total_space = parse_number("POOL_TOTAL_SPACE", &v)?;
        }
        if let Some(v) = lookup("POOL_DATA_PATH") {
            self.repository.store = StoreConfig::LocalFs {
                path: PathBuf::from(v),
            };
        }
        if let Some(v) = lookup("POOL_NOTIFICATION") {
            self.repository.notification = match v.to_ascii_lowercase().as_str() {
                "ordered" => NotificationMode::Ordered,
                "sync" | "synchronous" => NotificationMode::Synchronous,
                other => {
                    return Err(ConfigError::Parse(format!(
                        "POOL_NOTIFICATION: unknown mode {}",
                        other
                    )))
                }
            };
        }
        if let Some(v) = lookup("POOL_REMOVE_TIMEOUT_SECS") {
            self.nearline.remove_timeout =
                Duration::from_secs(parse_number("POOL_REMOVE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("POOL_MAX_ACTIVE_REMOVES") {
            self.nearline.max_active_removes = parse_number("POOL_MAX_ACTIVE_REMOVES", &v)?;
        }
        if let Some(v) = lookup("POOL_LOG_FORMAT") {
            self.logging.format = match v.to_ascii_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => {
                    return Err(ConfigError::Parse(format!(
                        "POOL_LOG_FORMAT: unknown format {}",
                        other
                    )))
                }
            };
        }
        if let Some(v) = lookup("RUST_LOG") {
            self.logging.filter = v;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.sticky_sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sticky_sweep_interval must be positive".to_string(),
            ));
        }
        if self.nearline.max_active_removes == 0 {
            return Err(ConfigError::Invalid(
                "max_active_removes must be positive".to_string(),
            ));
        }
        if self.nearline.remove_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "remove_timeout must be positive".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for hsm in &self.nearline.hsm {
            if !seen.insert((hsm.hsm_type.as_str(), hsm.instance.as_str())) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate HSM {} of type {}",
                    hsm.instance, hsm.hsm_type
                )));
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Parse(format!("{}: not a number: {}", key, value)))
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde helper for Duration as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
