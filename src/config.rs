//! Configuration module for the collector.
//!
//! Settings come from a TOML file; a few values can be overridden from
//! environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::probe::CheckKind;

/// Default config file looked up when neither `--config` nor `VANTAGE_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "config/vantage.toml";

/// Configuration error types. All of these are fatal at start-up.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration file layout.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Region reported when the probe identity cannot be discovered.
    #[serde(default = "default_region")]
    pub region: String,
    pub collector: CollectorConfig,
    #[serde(default)]
    pub probe: ProbeDiscoveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Cycle settings. The interval, worker limit and timeouts are required.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    pub interval_sec: u64,
    pub max_workers: usize,
    #[serde(flatten)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub thresholds: Thresholds,
    /// DNS server used by `dns` checks (`host` or `host:port`).
    #[serde(default)]
    pub dns_server: Option<String>,
    #[serde(default = "default_hosts_path")]
    pub hosts_path: PathBuf,
    #[serde(default = "default_services_path")]
    pub services_path: PathBuf,
}

/// Per-kind timeouts in seconds. `ssl_cert` shares the tcp timeout and
/// `json_api` shares the http timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Timeouts {
    pub ping_timeout_sec: u64,
    pub http_timeout_sec: u64,
    pub dns_timeout_sec: u64,
    pub tcp_timeout_sec: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ping_timeout_sec: 2,
            http_timeout_sec: 10,
            dns_timeout_sec: 3,
            tcp_timeout_sec: 3,
        }
    }
}

impl Timeouts {
    pub fn for_kind(&self, kind: CheckKind) -> Duration {
        let secs = match kind {
            CheckKind::Ping => self.ping_timeout_sec,
            CheckKind::Http | CheckKind::JsonApi => self.http_timeout_sec,
            CheckKind::Dns => self.dns_timeout_sec,
            CheckKind::Tcp | CheckKind::SslCert => self.tcp_timeout_sec,
        };
        Duration::from_secs(secs.max(1))
    }
}

/// Latency limits in milliseconds, two tiers per kind.
///
/// Crossing `*_warn_ms` degrades a check to WARN; `*_very_slow_ms` only
/// changes the `slow_level` annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub ping_warn_ms: u64,
    pub ping_very_slow_ms: u64,
    pub http_warn_ms: u64,
    pub http_very_slow_ms: u64,
    pub dns_warn_ms: u64,
    pub dns_very_slow_ms: u64,
    pub tcp_warn_ms: u64,
    pub tcp_very_slow_ms: u64,
    pub json_warn_ms: u64,
    pub json_very_slow_ms: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            ping_warn_ms: 500,
            ping_very_slow_ms: 1500,
            http_warn_ms: 8000,
            http_very_slow_ms: 20000,
            dns_warn_ms: 1200,
            dns_very_slow_ms: 3000,
            tcp_warn_ms: 1500,
            tcp_very_slow_ms: 4000,
            json_warn_ms: 8000,
            json_very_slow_ms: 20000,
        }
    }
}

/// Where and how the probe discovers its own public viewpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeDiscoveryConfig {
    pub ip_echo_url: String,
    /// Geo-IP lookup URL; `{ip}` is replaced with the public address.
    pub geo_url: String,
    pub cache_path: PathBuf,
    pub timeout_sec: u64,
}

impl Default for ProbeDiscoveryConfig {
    fn default() -> Self {
        Self {
            ip_echo_url: "https://api.ipify.org?format=json".to_string(),
            geo_url: "https://ipapi.co/{ip}/json/".to_string(),
            cache_path: PathBuf::from("probe_cache.json"),
            timeout_sec: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file (default: "vantage.db")
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("vantage.db"),
        }
    }
}

fn default_region() -> String {
    "UNKNOWN".to_string()
}

fn default_hosts_path() -> PathBuf {
    PathBuf::from("hosts.json")
}

fn default_services_path() -> PathBuf {
    PathBuf::from("services.json")
}

impl Config {
    /// Resolve the config path from the CLI flag, then `VANTAGE_CONFIG`,
    /// then [`DEFAULT_CONFIG_PATH`].
    pub fn locate(cli_path: Option<PathBuf>) -> PathBuf {
        cli_path
            .or_else(|| env::var("VANTAGE_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from a TOML file and apply environment overrides.
    ///
    /// Environment variables:
    /// - `VANTAGE_DB_PATH`: database file path
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut cfg = Self::parse(&raw, path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        cfg.resolve_paths(base);

        if let Ok(db_path) = env::var("VANTAGE_DB_PATH") {
            cfg.storage.db_path = PathBuf::from(db_path);
        }

        Ok(cfg)
    }

    fn parse(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.collector.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "collector.max_workers must be at least 1".to_string(),
            ));
        }
        if self.region.trim().is_empty() {
            return Err(ConfigError::Invalid("region must not be empty".to_string()));
        }
        Ok(())
    }

    /// Make relative file paths relative to the config file's directory.
    fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.collector.hosts_path,
            &mut self.collector.services_path,
            &mut self.probe.cache_path,
            &mut self.storage.db_path,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.collector.interval_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
region = "EU"

[collector]
interval_sec = 60
max_workers = 8
ping_timeout_sec = 2
http_timeout_sec = 10
dns_timeout_sec = 3
tcp_timeout_sec = 4
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = Config::parse(MINIMAL, Path::new("vantage.toml")).unwrap();
        assert_eq!(cfg.region, "EU");
        assert_eq!(cfg.collector.interval_sec, 60);
        assert_eq!(cfg.collector.thresholds, Thresholds::default());
        assert_eq!(cfg.collector.timeouts.tcp_timeout_sec, 4);
        assert_eq!(cfg.probe.timeout_sec, 4);
        assert_eq!(cfg.storage.db_path, PathBuf::from("vantage.db"));
    }

    #[test]
    fn test_partial_thresholds_keep_other_defaults() {
        let raw = format!("{MINIMAL}\n[collector.thresholds]\nping_warn_ms = 250\n");
        let cfg = Config::parse(&raw, Path::new("vantage.toml")).unwrap();
        assert_eq!(cfg.collector.thresholds.ping_warn_ms, 250);
        assert_eq!(cfg.collector.thresholds.ping_very_slow_ms, 1500);
        assert_eq!(cfg.collector.thresholds.http_warn_ms, 8000);
    }

    #[test]
    fn test_missing_required_field_is_error() {
        let raw = "[collector]\ninterval_sec = 60\nmax_workers = 4\n";
        let err = Config::parse(raw, Path::new("vantage.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let raw = MINIMAL.replace("max_workers = 8", "max_workers = 0");
        let err = Config::parse(&raw, Path::new("vantage.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_resolves_paths_against_config_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vantage.toml");
        fs::write(&path, MINIMAL).unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.collector.hosts_path, dir.path().join("hosts.json"));
        assert_eq!(cfg.probe.cache_path, dir.path().join("probe_cache.json"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/vantage.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_timeouts_per_kind() {
        let t = Timeouts::default();
        assert_eq!(t.for_kind(CheckKind::SslCert), Duration::from_secs(3));
        assert_eq!(t.for_kind(CheckKind::JsonApi), Duration::from_secs(10));
        assert_eq!(t.for_kind(CheckKind::Ping), Duration::from_secs(2));
    }
}
