//! Host and service inventories.
//!
//! Both are JSON arrays on disk. Hosts are loaded once per process; the
//! service list is re-read at the start of every cycle.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConfigError;

/// A network host that services can point at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Host {
    #[serde(default)]
    pub host_id: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Host {
    /// The configured address, trimmed. Blank addresses count as absent.
    pub fn address(&self) -> Option<&str> {
        self.address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }
}

/// A configured check. The unit of scheduling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    /// Blank when absent; such services are skipped at planning time.
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<i64>,
    /// Check kind as written in the file; parsed when the target is planned.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub params: ServiceParams,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

/// Kind-specific parameters. Which ones matter depends on the check kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceParams {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub expect_key: Option<String>,
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

/// Hosts indexed by `host_id`.
pub type HostMap = HashMap<String, Host>;

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Decode each array entry on its own, logging and dropping entries that
/// do not fit `T`. Only an unreadable file or a non-array is an error.
fn read_entries<T: DeserializeOwned>(path: &Path, what: &str) -> Result<Vec<T>, ConfigError> {
    let entries: Vec<Value> = read_json(path)?;
    Ok(entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::error!(
                    "Skipping {} entry #{} in {}: {}",
                    what,
                    index,
                    path.display(),
                    e
                );
                None
            }
        })
        .collect())
}

/// Load the host list. Entries with an empty `host_id` are dropped.
pub fn load_hosts(path: &Path) -> Result<HostMap, ConfigError> {
    let hosts: Vec<Host> = read_entries(path, "host")?;
    Ok(hosts
        .into_iter()
        .filter(|h| !h.host_id.trim().is_empty())
        .map(|h| (h.host_id.clone(), h))
        .collect())
}

/// Load the service list, keeping only enabled services. Malformed
/// entries are logged and left out.
pub fn load_services(path: &Path) -> Result<Vec<Service>, ConfigError> {
    let services: Vec<Service> = read_entries(path, "service")?;
    Ok(services.into_iter().filter(|s| s.enabled).collect())
}
