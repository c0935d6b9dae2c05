//! Turning a configured service into a runnable check.

use std::fmt;

use crate::inventory::{Host, HostMap, Service, ServiceParams};
use crate::probe::{CheckKind, CheckTarget};

/// Why a service was left out of a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingServiceId,
    UnknownKind(String),
    UnknownHost(String),
    MissingAddress,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingServiceId => write!(f, "missing_field:service_id"),
            SkipReason::UnknownKind(kind) => write!(f, "unknown_type:{}", kind),
            SkipReason::UnknownHost(host_id) => write!(f, "unknown_host_id={}", host_id),
            SkipReason::MissingAddress => write!(f, "missing_field:host.address"),
        }
    }
}

/// A service ready to be evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCheck {
    pub service_id: String,
    pub host_id: Option<String>,
    pub project_id: Option<i64>,
    pub kind: CheckKind,
    pub address: Option<String>,
    /// The check to run, or the name of the required field that is missing.
    pub target: Result<CheckTarget, &'static str>,
}

/// Resolve a service against the host list.
pub fn plan(service: &Service, hosts: &HostMap) -> Result<PlannedCheck, SkipReason> {
    if service.service_id.trim().is_empty() {
        return Err(SkipReason::MissingServiceId);
    }

    let kind: CheckKind = service
        .kind
        .parse()
        .map_err(|_| SkipReason::UnknownKind(service.kind.clone()))?;

    let host = match &service.host_id {
        Some(host_id) => match hosts.get(host_id) {
            Some(host) => Some(host),
            // json_api is self-contained through its URL
            None if kind == CheckKind::JsonApi => None,
            None => return Err(SkipReason::UnknownHost(host_id.clone())),
        },
        None => None,
    };

    let address = resolve_address(&service.params, host);
    if kind.requires_address() && address.is_none() {
        return Err(SkipReason::MissingAddress);
    }

    let target = build_check_target(kind, &service.params, address.as_deref());

    Ok(PlannedCheck {
        service_id: service.service_id.clone(),
        host_id: service.host_id.clone(),
        project_id: service.project_id,
        kind,
        address,
        target,
    })
}

/// The host's address, else the hostname in `params.url`.
pub fn resolve_address(params: &ServiceParams, host: Option<&Host>) -> Option<String> {
    host.and_then(Host::address)
        .map(str::to_string)
        .or_else(|| params.url.as_deref().and_then(hostname_from_url))
}

/// Hostname of a URL, without IPv6 brackets.
pub fn hostname_from_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    match parsed.host()? {
        url::Host::Domain(domain) => Some(domain.to_string()),
        url::Host::Ipv4(ip) => Some(ip.to_string()),
        url::Host::Ipv6(ip) => Some(ip.to_string()),
    }
}

/// Build the kind-specific payload. On failure returns the missing field.
pub fn build_check_target(
    kind: CheckKind,
    params: &ServiceParams,
    address: Option<&str>,
) -> Result<CheckTarget, &'static str> {
    let host = || address.map(str::to_string).ok_or("host");

    match kind {
        CheckKind::Ping => Ok(CheckTarget::Ping { host: host()? }),
        CheckKind::Dns => Ok(CheckTarget::Dns { name: host()? }),
        CheckKind::Http => {
            let url = match (&params.url, address) {
                (Some(url), _) if !url.trim().is_empty() => url.clone(),
                (_, Some(addr)) => {
                    let scheme = params.scheme.as_deref().unwrap_or("https");
                    let path = params.path.as_deref().unwrap_or("/");
                    format!("{}://{}{}", scheme, url_host(addr), path)
                }
                _ => return Err("url"),
            };
            Ok(CheckTarget::Http { url })
        }
        CheckKind::Tcp => {
            let host = host().map_err(|_| "host|port")?;
            let port = params.port.ok_or("host|port")?;
            Ok(CheckTarget::Tcp { host, port })
        }
        CheckKind::SslCert => Ok(CheckTarget::SslCert {
            host: host().map_err(|_| "host|port")?,
            port: params.port.unwrap_or(443),
        }),
        CheckKind::JsonApi => {
            let url = params
                .url
                .clone()
                .filter(|u| !u.trim().is_empty())
                .ok_or("url")?;
            Ok(CheckTarget::JsonApi {
                url,
                expect_key: params.expect_key.clone(),
            })
        }
    }
}

/// Bracket bare IPv6 literals for use in a URL authority.
fn url_host(addr: &str) -> String {
    if addr.contains(':') && !addr.starts_with('[') {
        format!("[{}]", addr)
    } else {
        addr.to_string()
    }
}
