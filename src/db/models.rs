//! Database model types.

use chrono::{DateTime, Utc};

use crate::probe::{CheckKind, Diagnostics, Status};

/// One time-stamped result for one target in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub ts: DateTime<Utc>,
    /// The probe's own region, never the target's location.
    pub region: String,
    pub project_id: Option<i64>,
    pub target_id: String,
    pub host_id: Option<String>,
    pub kind: CheckKind,
    pub status: Status,
    pub latency_ms: u64,
    pub meta: Diagnostics,
}
