//! Probe identity: the viewpoint this collector measures from.
//!
//! Resolution order, first success wins:
//! 1. explicit override (`VANTAGE_PROBE_*` environment variables)
//! 2. the on-disk cache, if younger than [`CACHE_TTL_HOURS`]
//! 3. live discovery: public IP, then geo-IP, then country→region
//!
//! Discovery failures never abort; they degrade to the configured
//! fallback region.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ProbeDiscoveryConfig;

/// Cached identities older than this are rediscovered.
pub const CACHE_TTL_HOURS: i64 = 24;

/// Identity discovery error types.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("no public ip in response")]
    NoPublicIp,
    #[error("cache error: {0}")]
    Cache(String),
}

/// Where a probe identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeSource {
    Override,
    Cache,
    IpGeo,
    FallbackNoPublicIp,
    FallbackNoGeo,
}

impl ProbeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeSource::Override => "override",
            ProbeSource::Cache => "cache",
            ProbeSource::IpGeo => "ip_geo",
            ProbeSource::FallbackNoPublicIp => "fallback_no_public_ip",
            ProbeSource::FallbackNoGeo => "fallback_no_geo",
        }
    }
}

impl fmt::Display for ProbeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resolved viewpoint of this probe. This is also the on-disk cache
/// record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeIdentity {
    pub region: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    pub source: ProbeSource,
    #[serde(default)]
    pub cached_at: Option<DateTime<Utc>>,
}

impl ProbeIdentity {
    pub fn fallback(region: &str, source: ProbeSource) -> Self {
        Self {
            region: region.to_string(),
            country: None,
            city: None,
            public_ip: None,
            source,
            cached_at: None,
        }
    }

    /// Whether a cached record is still inside its validity window.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.cached_at {
            Some(at) => now - at <= chrono::Duration::hours(CACHE_TTL_HOURS),
            None => false,
        }
    }
}

/// Coarse region bucket for an ISO 3166-1 alpha-2 country code.
pub fn region_from_country(country_code: &str) -> &'static str {
    match country_code.to_ascii_uppercase().as_str() {
        // Europe
        "FR" | "ES" | "PT" | "BE" | "NL" | "DE" | "LU" | "IT" | "GB" | "IE" | "CH" | "AT"
        | "SE" | "NO" | "DK" | "FI" | "PL" | "CZ" | "SK" | "HU" | "RO" | "BG" | "GR" | "HR"
        | "SI" | "EE" | "LV" | "LT" => "EU",

        // North America
        "US" | "CA" | "MX" => "NA",

        // South America
        "BR" | "AR" | "CL" | "CO" | "PE" | "UY" | "PY" | "BO" | "EC" | "VE" => "SA",

        // Africa
        "MA" | "DZ" | "TN" | "EG" | "ZA" | "NG" | "KE" | "GH" | "SN" | "CI" | "CM" | "ET"
        | "UG" | "TZ" | "RW" => "AF",

        // Asia, including the Middle East
        "TR" | "SA" | "AE" | "QA" | "KW" | "OM" | "BH" | "IN" | "PK" | "BD" | "CN" | "JP"
        | "KR" | "SG" | "MY" | "TH" | "VN" | "ID" | "PH" | "HK" | "TW" => "AS",

        // Oceania
        "AU" | "NZ" => "OC",

        _ => "OTHER",
    }
}

/// Operator-forced identity, read from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOverride {
    pub region: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub public_ip: Option<String>,
}

impl ProbeOverride {
    /// Environment variables:
    /// - `VANTAGE_PROBE_REGION`: activates the override
    /// - `VANTAGE_PROBE_COUNTRY`, `VANTAGE_PROBE_CITY`, `VANTAGE_PROBE_PUBLIC_IP`: optional
    pub fn from_env() -> Self {
        let read = |key: &str| env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            region: read("VANTAGE_PROBE_REGION"),
            country: read("VANTAGE_PROBE_COUNTRY"),
            city: read("VANTAGE_PROBE_CITY"),
            public_ip: read("VANTAGE_PROBE_PUBLIC_IP"),
        }
    }

    fn identity(&self) -> Option<ProbeIdentity> {
        let region = self.region.clone()?;
        Some(ProbeIdentity {
            region,
            country: self.country.clone(),
            city: self.city.clone(),
            public_ip: self.public_ip.clone(),
            source: ProbeSource::Override,
            cached_at: None,
        })
    }
}

/// Geolocation of a public address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub city: Option<String>,
}

/// Network side of discovery.
#[async_trait::async_trait]
pub trait GeoDiscovery: Send + Sync {
    async fn public_ip(&self) -> Result<String, IdentityError>;
    async fn locate(&self, ip: &str) -> Result<GeoInfo, IdentityError>;
}

#[derive(Debug, Deserialize)]
struct IpEchoResponse {
    #[serde(default)]
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    city: Option<String>,
}

/// Discovery through an IP-echo service and a geo-IP service over HTTPS.
pub struct HttpGeoDiscovery {
    client: reqwest::Client,
    ip_echo_url: String,
    geo_url: String,
}

impl HttpGeoDiscovery {
    pub fn new(cfg: &ProbeDiscoveryConfig) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_sec.max(1)))
            .user_agent(crate::probe::USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            ip_echo_url: cfg.ip_echo_url.clone(),
            geo_url: cfg.geo_url.clone(),
        })
    }
}

#[async_trait::async_trait]
impl GeoDiscovery for HttpGeoDiscovery {
    async fn public_ip(&self) -> Result<String, IdentityError> {
        let response: IpEchoResponse = self
            .client
            .get(&self.ip_echo_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response
            .ip
            .filter(|ip| !ip.trim().is_empty())
            .ok_or(IdentityError::NoPublicIp)
    }

    async fn locate(&self, ip: &str) -> Result<GeoInfo, IdentityError> {
        let url = self.geo_url.replace("{ip}", ip);
        let response: GeoResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let country = response
            .country_code
            .or(response.country)
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty());
        let city = response.city.filter(|c| !c.trim().is_empty());

        Ok(GeoInfo { country, city })
    }
}

/// Resolves the probe identity once at start-up.
pub struct IdentityResolver<D> {
    overrides: ProbeOverride,
    cache_path: PathBuf,
    discovery: D,
}

impl<D: GeoDiscovery> IdentityResolver<D> {
    pub fn new(overrides: ProbeOverride, cache_path: impl Into<PathBuf>, discovery: D) -> Self {
        Self {
            overrides,
            cache_path: cache_path.into(),
            discovery,
        }
    }

    /// Resolve the identity, falling back to `fallback_region` when
    /// discovery cannot complete. Never fails.
    pub async fn resolve(&self, fallback_region: &str) -> ProbeIdentity {
        if let Some(identity) = self.overrides.identity() {
            return identity;
        }

        let now = Utc::now();
        if let Some(mut cached) = load_cache(&self.cache_path) {
            if cached.is_fresh(now) && !cached.region.is_empty() {
                cached.source = ProbeSource::Cache;
                return cached;
            }
        }

        let public_ip = match self.discovery.public_ip().await {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!("Public IP discovery failed: {}", e);
                return ProbeIdentity::fallback(fallback_region, ProbeSource::FallbackNoPublicIp);
            }
        };

        let geo = match self.discovery.locate(&public_ip).await {
            Ok(geo) => geo,
            Err(e) => {
                tracing::warn!("Geo-IP lookup for {} failed: {}", public_ip, e);
                GeoInfo::default()
            }
        };

        let Some(country) = geo.country else {
            let mut identity =
                ProbeIdentity::fallback(fallback_region, ProbeSource::FallbackNoGeo);
            identity.public_ip = Some(public_ip);
            identity.city = geo.city;
            return identity;
        };

        let identity = ProbeIdentity {
            region: region_from_country(&country).to_string(),
            country: Some(country),
            city: geo.city,
            public_ip: Some(public_ip),
            source: ProbeSource::IpGeo,
            cached_at: Some(now),
        };

        if let Err(e) = save_cache(&self.cache_path, &identity) {
            tracing::debug!("Could not write probe cache {}: {}", self.cache_path.display(), e);
        }

        identity
    }
}

fn load_cache(path: &Path) -> Option<ProbeIdentity> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(identity) => Some(identity),
        Err(e) => {
            tracing::debug!("Ignoring unreadable probe cache {}: {}", path.display(), e);
            None
        }
    }
}

fn save_cache(path: &Path, identity: &ProbeIdentity) -> Result<(), IdentityError> {
    let json =
        serde_json::to_string_pretty(identity).map_err(|e| IdentityError::Cache(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| IdentityError::Cache(e.to_string()))?;
    }
    fs::write(path, json).map_err(|e| IdentityError::Cache(e.to_string()))
}
