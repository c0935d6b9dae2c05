//! Scheduler module: runs one measurement cycle across all services.
//!
//! A cycle plans every service, evaluates the runnable ones on a bounded
//! pool of tasks, waits for all of them, then writes the measurements.

mod plan;
mod streak;

pub use plan::*;
pub use streak::*;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::ConfigError;
use crate::db::{Measurement, MeasurementSink};
use crate::identity::ProbeIdentity;
use crate::inventory::{HostMap, Service};
use crate::probe::{
    run_isolated, CheckOutcome, CheckRunner, CheckSettings, Diagnostics, NetworkChecks, Status,
};

/// Totals for one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub measured: usize,
    pub skipped: usize,
    pub ok: usize,
    pub warn: usize,
    pub crit: usize,
    pub write_failures: usize,
    pub duration: Duration,
}

impl CycleReport {
    fn tally(&mut self, status: Status) {
        self.measured += 1;
        match status {
            Status::Ok => self.ok += 1,
            Status::Warn => self.warn += 1,
            Status::Crit => self.crit += 1,
        }
    }
}

/// Coordinates measurement cycles for one probe.
pub struct Collector<R = NetworkChecks> {
    runner: Arc<R>,
    settings: Arc<CheckSettings>,
    hosts: Arc<HostMap>,
    identity: Arc<ProbeIdentity>,
    streaks: Arc<StreakStore>,
    sink: Arc<dyn MeasurementSink>,
    max_workers: usize,
}

impl<R: CheckRunner> Collector<R> {
    pub fn new(
        runner: R,
        settings: CheckSettings,
        hosts: HostMap,
        identity: ProbeIdentity,
        sink: Arc<dyn MeasurementSink>,
        max_workers: usize,
    ) -> Self {
        Self {
            runner: Arc::new(runner),
            settings: Arc::new(settings),
            hosts: Arc::new(hosts),
            identity: Arc::new(identity),
            streaks: Arc::new(StreakStore::new()),
            sink,
            max_workers: max_workers.max(1),
        }
    }

    /// Evaluate every runnable service and return the measurements along
    /// with the number of services that were skipped.
    ///
    /// Returns only after every launched check has finished.
    pub async fn evaluate(&self, services: &[Service]) -> (Vec<Measurement>, usize) {
        let mut planned = Vec::with_capacity(services.len());
        let mut skipped = 0;

        for service in services {
            match plan(service, &self.hosts) {
                Ok(p) => planned.push(p),
                Err(reason) => {
                    tracing::error!("Skipping service {}: {}", service.service_id, reason);
                    skipped += 1;
                }
            }
        }

        if planned.is_empty() {
            return (Vec::new(), skipped);
        }

        let workers = self.max_workers.min(planned.len());
        let permits = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();

        for p in planned {
            let permits = permits.clone();
            let runner = self.runner.clone();
            let settings = self.settings.clone();
            let streaks = self.streaks.clone();
            let identity = self.identity.clone();

            tasks.spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                evaluate_one(p, runner, settings, &streaks, &identity).await
            });
        }

        let mut measurements = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(m) => measurements.push(m),
                Err(e) => tracing::error!("Cycle worker failed: {}", e),
            }
        }

        (measurements, skipped)
    }

    /// Run one full cycle: evaluate, then hand every measurement to the sink.
    pub async fn run_cycle(&self, services: &[Service]) -> CycleReport {
        let start = Instant::now();
        let (measurements, skipped) = self.evaluate(services).await;

        let mut report = CycleReport {
            skipped,
            ..Default::default()
        };

        for m in &measurements {
            report.tally(m.status);
            tracing::info!(
                "{} {} status={} latency_ms={} region={}",
                m.kind,
                m.target_id,
                m.status,
                m.latency_ms,
                m.region
            );
            if m.status == Status::Crit && m.meta.contains_key("hard_down") {
                let streak = self.streaks.get(&m.target_id);
                tracing::warn!(
                    "{} down for {} consecutive cycles",
                    m.target_id,
                    streak.consecutive_hard_failures
                );
            }
            if let Err(e) = self.sink.append(m) {
                report.write_failures += 1;
                tracing::error!("Failed to store measurement for {}: {}", m.target_id, e);
            }
        }

        report.duration = start.elapsed();
        tracing::info!(
            "Cycle done in {:.2}s: {} measured ({} ok, {} warn, {} crit), {} skipped, {} write failures",
            report.duration.as_secs_f64(),
            report.measured,
            report.ok,
            report.warn,
            report.crit,
            report.skipped,
            report.write_failures
        );

        report
    }

    /// Run cycles until `load_services` fails.
    ///
    /// Services are reloaded before every cycle. The next cycle starts
    /// `interval` after the previous one started, or immediately if the
    /// cycle overran.
    pub async fn run_forever<F>(
        &self,
        interval: Duration,
        mut load_services: F,
    ) -> Result<Infallible, ConfigError>
    where
        F: FnMut() -> Result<Vec<Service>, ConfigError>,
    {
        loop {
            let services = load_services()?;

            let report = self.run_cycle(&services).await;
            let pause = interval.saturating_sub(report.duration);
            if pause.is_zero() {
                tracing::warn!(
                    "Cycle took {:.2}s, longer than the {}s interval",
                    report.duration.as_secs_f64(),
                    interval.as_secs()
                );
            }
            tokio::time::sleep(pause).await;
        }
    }
}

async fn evaluate_one<R: CheckRunner>(
    planned: PlannedCheck,
    runner: Arc<R>,
    settings: Arc<CheckSettings>,
    streaks: &StreakStore,
    identity: &ProbeIdentity,
) -> Measurement {
    let mut outcome = match planned.target.clone() {
        Ok(target) => run_isolated(runner, target, settings).await,
        Err(field) => CheckOutcome::hard_failure(0, format!("missing_field:{}", field)),
    };

    enrich(&mut outcome.meta, &planned, identity);
    let outcome = streaks.apply(&planned.service_id, outcome);

    Measurement {
        ts: Utc::now(),
        region: identity.region.clone(),
        project_id: planned.project_id,
        target_id: planned.service_id,
        host_id: planned.host_id,
        kind: planned.kind,
        status: outcome.status,
        latency_ms: outcome.latency_ms,
        meta: outcome.meta,
    }
}

/// Add context keys to the diagnostics without overwriting executor keys.
fn enrich(meta: &mut Diagnostics, planned: &PlannedCheck, identity: &ProbeIdentity) {
    let text = |s: &Option<String>| s.clone().map(Value::String).unwrap_or(Value::Null);

    let host_address = planned
        .address
        .clone()
        .or_else(|| planned.host_id.clone())
        .unwrap_or_else(|| planned.service_id.clone());

    let context = [
        ("host_id", text(&planned.host_id)),
        ("service_id", Value::String(planned.service_id.clone())),
        ("host_address", Value::String(host_address)),
        ("probe_region", Value::String(identity.region.clone())),
        ("probe_country", text(&identity.country)),
        ("probe_city", text(&identity.city)),
        ("probe_public_ip", text(&identity.public_ip)),
        ("probe_source", Value::String(identity.source.to_string())),
    ];

    for (key, value) in context {
        meta.entry(key).or_insert(value);
    }
}
