//! Runtime configuration for simplefs-cache.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Storage knobs (directory, entry limit, disk budget, compression, sweep
//! cadence) live in [`StorageConfig`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid size {0:?}: {1}")]
    InvalidSize(String, String),

    #[error("Invalid entry limit {0:?}")]
    InvalidEntryLimit(String),
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "simplefs-cache", about = "Disk-backed HTTP cache storage server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "simplefs.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the configuration file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Storage directory (overrides the configuration file).
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage engine configuration.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// TTL applied to `PUT` requests that carry none, in seconds.
    pub default_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            default_ttl_secs: 3600,
        }
    }
}

/// Directory size budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectorySize {
    #[default]
    Unbounded,
    Bytes(u64),
}

impl DirectorySize {
    pub fn limit(&self) -> Option<u64> {
        match self {
            DirectorySize::Unbounded => None,
            DirectorySize::Bytes(limit) => Some(*limit),
        }
    }

    /// Parse `-1`, an empty string, a byte count or a human-readable size.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        if s.is_empty() || s == "-1" {
            return Ok(DirectorySize::Unbounded);
        }
        parse_size(s).map(DirectorySize::Bytes)
    }
}

impl fmt::Display for DirectorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectorySize::Unbounded => f.write_str("-1"),
            DirectorySize::Bytes(limit) => write!(f, "{limit}"),
        }
    }
}

impl Serialize for DirectorySize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DirectorySize::Unbounded => serializer.serialize_i64(-1),
            DirectorySize::Bytes(limit) => serializer.serialize_u64(*limit),
        }
    }
}

impl<'de> Deserialize<'de> for DirectorySize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum SizeValue {
            Number(f64),
            String(String),
        }

        match Option::<SizeValue>::deserialize(deserializer)? {
            None => Ok(DirectorySize::Unbounded),
            Some(SizeValue::Number(n)) if n <= 0.0 => Ok(DirectorySize::Unbounded),
            Some(SizeValue::Number(n)) => Ok(DirectorySize::Bytes(n as u64)),
            Some(SizeValue::String(s)) => DirectorySize::parse(&s).map_err(D::Error::custom),
        }
    }
}

/// Storage engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage directory. Falls back to the current working directory.
    pub path: Option<PathBuf>,

    /// Maximum number of index entries (0 = unbounded).
    #[serde(deserialize_with = "deserialize_entry_limit")]
    pub size: usize,

    /// Maximum bytes on disk (`-1` = unbounded). Accepts "100MB", "1.5 GiB".
    pub directory_size: DirectorySize,

    /// Compression method: "lz4", "zstd", "none" or "" (lz4).
    pub compression: String,

    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Time a variant stays usable as stale after its freshness ends, in seconds.
    pub stale_secs: u64,

    /// Interval between background expiry sweeps, in milliseconds.
    pub sweep_interval_ms: u64,

    /// Rebuild index entries from blob files found at startup. Ignored when
    /// no path is configured.
    pub recover_on_init: bool,

    /// TTL given to entries rebuilt at startup, in seconds.
    pub recovered_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            size: 0,
            directory_size: DirectorySize::Unbounded,
            compression: String::new(),
            zstd_level: 3,
            stale_secs: 0,
            sweep_interval_ms: 1000,
            recover_on_init: false,
            recovered_ttl_secs: 3600,
        }
    }
}

impl StorageConfig {
    /// Storage directory, falling back to the current working directory.
    pub fn resolve_path(&self) -> std::io::Result<PathBuf> {
        match &self.path {
            Some(path) if !path.as_os_str().is_empty() => Ok(path.clone()),
            _ => {
                tracing::info!("No storage path configured, falling back to the working directory");
                std::env::current_dir()
            }
        }
    }

    /// Recovery only runs on an explicitly configured directory.
    pub fn recovery_enabled(&self) -> bool {
        self.recover_on_init
            && self
                .path
                .as_ref()
                .is_some_and(|path| !path.as_os_str().is_empty())
    }

    pub fn stale(&self) -> Duration {
        Duration::from_secs(self.stale_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn recovered_ttl(&self) -> Duration {
        Duration::from_secs(self.recovered_ttl_secs)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(path) = &cli.path {
            self.storage.path = Some(path.clone());
        }
    }
}

/// Entry limits arrive as integers, floats or numeric strings.
fn deserialize_entry_limit<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum LimitValue {
        Number(f64),
        String(String),
    }

    match Option::<LimitValue>::deserialize(deserializer)? {
        None => Ok(0),
        Some(LimitValue::Number(n)) if n > 0.0 => Ok(n as usize),
        Some(LimitValue::Number(_)) => Ok(0),
        Some(LimitValue::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(0);
            }
            s.parse::<usize>()
                .map_err(|_| D::Error::custom(ConfigError::InvalidEntryLimit(s.to_string())))
        }
    }
}

/// Parse a size string like "64MB", "1.5 GiB" or "4096" into bytes.
///
/// Decimal suffixes (`KB`, `MB`, ...) are powers of 1000, binary suffixes
/// (`KiB`, `MiB`, ...) powers of 1024.
pub fn parse_size(s: &str) -> Result<u64, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidSize(s.to_string(), reason.to_string());

    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty size string"));
    }

    let (num_str, suffix) = match trimmed.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&trimmed[..idx], trimmed[idx..].trim().to_ascii_uppercase()),
        None => (trimmed, String::new()),
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| invalid("invalid number"))?;
    if !num.is_finite() || num < 0.0 {
        return Err(invalid("size must be a non-negative number"));
    }

    let multiplier: f64 = match suffix.as_str() {
        "" | "B" => 1.0,
        "K" | "KB" => 1e3,
        "M" | "MB" => 1e6,
        "G" | "GB" => 1e9,
        "T" | "TB" => 1e12,
        "KIB" => 1024.0,
        "MIB" => 1024.0 * 1024.0,
        "GIB" => 1024.0 * 1024.0 * 1024.0,
        "TIB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return Err(invalid("unknown size suffix")),
    };

    let bytes = num * multiplier;
    if bytes > u64::MAX as f64 {
        return Err(invalid("size overflow"));
    }
    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.storage.directory_size, DirectorySize::Unbounded);
        assert_eq!(cfg.storage.size, 0);
        assert_eq!(cfg.storage.compression, "");
        assert!(!cfg.storage.recover_on_init);
    }

    #[test]
    fn test_recovery_needs_explicit_path() {
        let mut storage = StorageConfig {
            recover_on_init: true,
            ..Default::default()
        };
        assert!(!storage.recovery_enabled());

        storage.path = Some(PathBuf::new());
        assert!(!storage.recovery_enabled());

        storage.path = Some(PathBuf::from("/var/cache/simplefs"));
        assert!(storage.recovery_enabled());

        storage.recover_on_init = false;
        assert!(!storage.recovery_enabled());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("1KB").unwrap(), 1000);
        assert_eq!(parse_size("1KiB").unwrap(), 1024);
        assert_eq!(parse_size("64MB").unwrap(), 64_000_000);
        assert_eq!(parse_size("1.5 GiB").unwrap(), 1_610_612_736);
        assert!(parse_size("ten").is_err());
        assert!(parse_size("5 parsecs").is_err());
    }

    #[test]
    fn test_directory_size_forms() {
        let parse = |json: &str| -> StorageConfig { serde_json::from_str(json).unwrap() };

        assert_eq!(parse(r#"{}"#).directory_size, DirectorySize::Unbounded);
        assert_eq!(parse(r#"{"directory_size": -1}"#).directory_size, DirectorySize::Unbounded);
        assert_eq!(parse(r#"{"directory_size": "-1"}"#).directory_size, DirectorySize::Unbounded);
        assert_eq!(parse(r#"{"directory_size": 2048}"#).directory_size, DirectorySize::Bytes(2048));
        assert_eq!(
            parse(r#"{"directory_size": "10MB"}"#).directory_size,
            DirectorySize::Bytes(10_000_000)
        );
        assert!(serde_json::from_str::<StorageConfig>(r#"{"directory_size": "lots"}"#).is_err());
    }

    #[test]
    fn test_entry_limit_forms() {
        let parse = |json: &str| -> StorageConfig { serde_json::from_str(json).unwrap() };

        assert_eq!(parse(r#"{"size": 500}"#).size, 500);
        assert_eq!(parse(r#"{"size": 12.0}"#).size, 12);
        assert_eq!(parse(r#"{"size": "64"}"#).size, 64);
        assert_eq!(parse(r#"{"size": -3}"#).size, 0);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from(["simplefs-cache", "--listen", "127.0.0.1:9000", "--path", "/var/cache/sfs"]);
        let mut cfg = Config::default();
        cfg.apply_cli(&cli);
        assert_eq!(cfg.server.listen, "127.0.0.1:9000");
        assert_eq!(cfg.storage.path, Some(PathBuf::from("/var/cache/sfs")));
    }
}
