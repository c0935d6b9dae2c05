//! Probe module for network monitoring.
//!
//! Supports ping, HTTP, DNS, TCP, TLS certificate and JSON API checks.
//! Every executor returns a [`CheckOutcome`]; errors are folded into
//! hard-failure outcomes and never escape to the caller.

mod dns;
mod http;
mod ping;
mod tcp;
mod thresholds;
mod tls;

pub use dns::*;
pub use http::*;
pub use ping::*;
pub use tcp::*;
pub use thresholds::*;
pub use tls::*;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::{Thresholds, Timeouts};

/// Extra time granted on top of a check's own timeout before the
/// isolation adapter gives up on it.
pub const TIMEOUT_GRACE: Duration = Duration::from_secs(2);

/// Free-form diagnostic metadata attached to every result.
pub type Diagnostics = serde_json::Map<String, Value>;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("timeout")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("tls error: {0}")]
    Tls(String),
}

/// Three-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    Ok = 0,
    Warn = 1,
    Crit = 2,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Status::Ok),
            1 => Some(Status::Warn),
            2 => Some(Status::Crit),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The closed set of check kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Ping,
    Http,
    Dns,
    Tcp,
    SslCert,
    JsonApi,
}

impl CheckKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckKind::Ping => "ping",
            CheckKind::Http => "http",
            CheckKind::Dns => "dns",
            CheckKind::Tcp => "tcp",
            CheckKind::SslCert => "ssl_cert",
            CheckKind::JsonApi => "json_api",
        }
    }

    /// Kinds that cannot run without a network address.
    pub fn requires_address(self) -> bool {
        matches!(
            self,
            CheckKind::Ping | CheckKind::Dns | CheckKind::Tcp | CheckKind::SslCert
        )
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for CheckKind {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ping" => Ok(CheckKind::Ping),
            "http" => Ok(CheckKind::Http),
            "dns" => Ok(CheckKind::Dns),
            "tcp" => Ok(CheckKind::Tcp),
            "ssl_cert" => Ok(CheckKind::SslCert),
            "json_api" => Ok(CheckKind::JsonApi),
            other => Err(ProbeError::Config(format!("unknown check type: {}", other))),
        }
    }
}

/// A fully-resolved check, one variant per kind with its own parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckTarget {
    Ping { host: String },
    Http { url: String },
    Dns { name: String },
    Tcp { host: String, port: u16 },
    SslCert { host: String, port: u16 },
    JsonApi { url: String, expect_key: Option<String> },
}

impl CheckTarget {
    pub fn kind(&self) -> CheckKind {
        match self {
            CheckTarget::Ping { .. } => CheckKind::Ping,
            CheckTarget::Http { .. } => CheckKind::Http,
            CheckTarget::Dns { .. } => CheckKind::Dns,
            CheckTarget::Tcp { .. } => CheckKind::Tcp,
            CheckTarget::SslCert { .. } => CheckKind::SslCert,
            CheckTarget::JsonApi { .. } => CheckKind::JsonApi,
        }
    }
}

/// Result of a single check before hysteresis.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub status: Status,
    pub latency_ms: u64,
    /// The target was unreachable or its protocol exchange failed.
    pub hard_down: bool,
    pub meta: Diagnostics,
}

impl CheckOutcome {
    pub fn ok(latency_ms: u64, meta: Diagnostics) -> Self {
        Self {
            status: Status::Ok,
            latency_ms,
            hard_down: false,
            meta,
        }
    }

    /// A degraded result: reachable, but slow or semantically wrong.
    pub fn degraded(latency_ms: u64, mut meta: Diagnostics, reason: impl Into<String>) -> Self {
        meta.insert("reason".into(), Value::String(reason.into()));
        Self {
            status: Status::Warn,
            latency_ms,
            hard_down: false,
            meta,
        }
    }

    pub fn hard_failure(latency_ms: u64, error: impl Into<String>) -> Self {
        Self::hard_failure_with(latency_ms, Diagnostics::new(), error)
    }

    pub fn hard_failure_with(
        latency_ms: u64,
        mut meta: Diagnostics,
        error: impl Into<String>,
    ) -> Self {
        meta.insert("error".into(), Value::String(error.into()));
        meta.insert("hard_down".into(), Value::Bool(true));
        Self {
            status: Status::Crit,
            latency_ms,
            hard_down: true,
            meta,
        }
    }

    pub fn from_error(latency_ms: u64, meta: Diagnostics, err: &ProbeError) -> Self {
        Self::hard_failure_with(latency_ms, meta, err.to_string())
    }
}

/// Everything an executor needs besides its target.
#[derive(Debug, Clone, Default)]
pub struct CheckSettings {
    pub timeouts: Timeouts,
    pub thresholds: Thresholds,
    /// Resolver for `dns` checks; `None` uses the system resolver.
    pub dns_server: Option<String>,
}

/// Executes a resolved check. The production runner talks to the network;
/// tests substitute scripted runners.
#[async_trait::async_trait]
pub trait CheckRunner: Send + Sync + 'static {
    async fn run(&self, target: &CheckTarget, settings: &CheckSettings) -> CheckOutcome;
}

/// Runner backed by the real network executors.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkChecks;

#[async_trait::async_trait]
impl CheckRunner for NetworkChecks {
    async fn run(&self, target: &CheckTarget, settings: &CheckSettings) -> CheckOutcome {
        run_check(target, settings).await
    }
}

/// Dispatch a target to the executor for its kind.
pub async fn run_check(target: &CheckTarget, settings: &CheckSettings) -> CheckOutcome {
    let timeout = settings.timeouts.for_kind(target.kind());
    let th = &settings.thresholds;

    match target {
        CheckTarget::Ping { host } => check_ping(host, timeout, th.ping()).await,
        CheckTarget::Http { url } => check_http(url, timeout, th.http()).await,
        CheckTarget::Dns { name } => {
            check_dns(name, settings.dns_server.as_deref(), timeout, th.dns()).await
        }
        CheckTarget::Tcp { host, port } => check_tcp(host, *port, timeout, th.tcp()).await,
        CheckTarget::SslCert { host, port } => check_ssl_cert(host, *port, timeout).await,
        CheckTarget::JsonApi { url, expect_key } => {
            check_json_api(url, expect_key.as_deref(), timeout, th.json()).await
        }
    }
}

/// Run a check on its own task, bounded by its timeout plus [`TIMEOUT_GRACE`].
///
/// A panic or an overrun is converted into a hard-failure outcome, so the
/// caller always gets a result.
pub async fn run_isolated<R: CheckRunner>(
    runner: Arc<R>,
    target: CheckTarget,
    settings: Arc<CheckSettings>,
) -> CheckOutcome {
    let budget = settings.timeouts.for_kind(target.kind()) + TIMEOUT_GRACE;
    let start = Instant::now();

    let mut handle = tokio::spawn(async move { runner.run(&target, &settings).await });

    match tokio::time::timeout(budget, &mut handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            tracing::error!("Check executor failed: {}", e);
            CheckOutcome::hard_failure(elapsed_ms(start), format!("executor_panicked: {}", e))
        }
        Err(_) => {
            handle.abort();
            CheckOutcome::hard_failure(elapsed_ms(start), "timeout")
        }
    }
}

/// Milliseconds since `start`.
pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
