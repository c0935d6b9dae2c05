//! Status classification shared by the executors.

use serde_json::Value;

use super::{CheckOutcome, Diagnostics, Status};
use crate::config::Thresholds;

/// Certificates with at least this many days left are healthy.
pub const CERT_OK_DAYS: i64 = 30;
/// Certificates with fewer days left than this are critical.
pub const CERT_CRIT_DAYS: i64 = 7;

/// Two-tier latency limits for one check kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyLimits {
    pub warn_ms: u64,
    pub very_slow_ms: u64,
}

/// How slow a degraded result was. Only annotates diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowLevel {
    Mild,
    Very,
}

impl SlowLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SlowLevel::Mild => "mild",
            SlowLevel::Very => "very",
        }
    }
}

impl LatencyLimits {
    /// `None` when the latency is under the warn limit.
    pub fn classify(&self, latency_ms: u64) -> Option<SlowLevel> {
        if latency_ms < self.warn_ms {
            None
        } else if latency_ms >= self.very_slow_ms {
            Some(SlowLevel::Very)
        } else {
            Some(SlowLevel::Mild)
        }
    }

    /// Grade a protocol-level success by latency alone.
    ///
    /// Slow results are WARN with `reason = <reason>` and a `slow_level`
    /// annotation; nothing here ever yields CRIT.
    pub fn grade(&self, latency_ms: u64, mut meta: Diagnostics, reason: &str) -> CheckOutcome {
        match self.classify(latency_ms) {
            None => CheckOutcome::ok(latency_ms, meta),
            Some(level) => {
                meta.insert("slow_level".into(), Value::String(level.as_str().into()));
                CheckOutcome::degraded(latency_ms, meta, reason)
            }
        }
    }
}

impl Thresholds {
    pub fn ping(&self) -> LatencyLimits {
        LatencyLimits {
            warn_ms: self.ping_warn_ms,
            very_slow_ms: self.ping_very_slow_ms,
        }
    }

    pub fn http(&self) -> LatencyLimits {
        LatencyLimits {
            warn_ms: self.http_warn_ms,
            very_slow_ms: self.http_very_slow_ms,
        }
    }

    pub fn dns(&self) -> LatencyLimits {
        LatencyLimits {
            warn_ms: self.dns_warn_ms,
            very_slow_ms: self.dns_very_slow_ms,
        }
    }

    pub fn tcp(&self) -> LatencyLimits {
        LatencyLimits {
            warn_ms: self.tcp_warn_ms,
            very_slow_ms: self.tcp_very_slow_ms,
        }
    }

    pub fn json(&self) -> LatencyLimits {
        LatencyLimits {
            warn_ms: self.json_warn_ms,
            very_slow_ms: self.json_very_slow_ms,
        }
    }
}

/// Certificate expiry bands: >= 30 days OK, 7..=29 WARN, < 7 CRIT.
pub fn grade_cert_expiry(days_left: i64) -> Status {
    if days_left >= CERT_OK_DAYS {
        Status::Ok
    } else if days_left >= CERT_CRIT_DAYS {
        Status::Warn
    } else {
        Status::Crit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: LatencyLimits = LatencyLimits {
        warn_ms: 500,
        very_slow_ms: 1500,
    };

    #[test]
    fn test_classify_latency() {
        assert_eq!(LIMITS.classify(0), None);
        assert_eq!(LIMITS.classify(499), None);
        assert_eq!(LIMITS.classify(500), Some(SlowLevel::Mild));
        assert_eq!(LIMITS.classify(1499), Some(SlowLevel::Mild));
        assert_eq!(LIMITS.classify(1500), Some(SlowLevel::Very));
    }

    #[test]
    fn test_very_slow_is_still_warn() {
        let outcome = LIMITS.grade(u64::MAX, Diagnostics::new(), "slow_ping");
        assert_eq!(outcome.status, Status::Warn);
        assert!(!outcome.hard_down);
        assert_eq!(outcome.meta["slow_level"], "very");
        assert_eq!(outcome.meta["reason"], "slow_ping");
    }

    #[test]
    fn test_fast_is_ok_without_annotations() {
        let outcome = LIMITS.grade(20, Diagnostics::new(), "slow_ping");
        assert_eq!(outcome.status, Status::Ok);
        assert!(outcome.meta.is_empty());
    }

    #[test]
    fn test_cert_expiry_bands() {
        assert_eq!(grade_cert_expiry(45), Status::Ok);
        assert_eq!(grade_cert_expiry(30), Status::Ok);
        assert_eq!(grade_cert_expiry(29), Status::Warn);
        assert_eq!(grade_cert_expiry(10), Status::Warn);
        assert_eq!(grade_cert_expiry(7), Status::Warn);
        assert_eq!(grade_cert_expiry(6), Status::Crit);
        assert_eq!(grade_cert_expiry(3), Status::Crit);
        assert_eq!(grade_cert_expiry(-2), Status::Crit);
    }

    #[test]
    fn test_default_limits() {
        let th = Thresholds::default();
        assert_eq!(th.ping(), LIMITS);
        assert_eq!(th.tcp().very_slow_ms, 4000);
        assert_eq!(th.json().warn_ms, 8000);
    }
}
