//! SQLite database store implementation.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection};
use thiserror::Error;

use super::models::*;
use super::MeasurementSink;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    /// Insert one measurement row.
    pub fn add_measurement(&self, m: &Measurement) -> Result<i64, DbError> {
        let meta_json = if m.meta.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&m.meta)?)
        };

        let conn = self.conn();
        conn.execute(
            "INSERT INTO measurements (ts, region, project_id, target_id, host_id, type, status, latency_ms, meta_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                m.ts.format(TIME_FORMAT).to_string(),
                m.region,
                m.project_id,
                m.target_id,
                m.host_id,
                m.kind.as_str(),
                m.status.code(),
                m.latency_ms as i64,
                meta_json,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent measurements, newest first.
    pub fn recent_measurements(&self, limit: u32) -> Result<Vec<Measurement>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT ts, region, project_id, target_id, host_id, type, status, latency_ms, meta_json
             FROM measurements ORDER BY ts DESC, id DESC LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (ts, region, project_id, target_id, host_id, kind, status, latency_ms, meta) in rows {
            let (Ok(kind), Some(status)) = (kind.parse(), crate::probe::Status::from_code(status))
            else {
                tracing::warn!("Skipping unreadable measurement row for {}", target_id);
                continue;
            };
            out.push(Measurement {
                ts: parse_db_time(&ts).unwrap_or_else(Utc::now),
                region,
                project_id,
                target_id,
                host_id,
                kind,
                status,
                latency_ms: latency_ms.max(0) as u64,
                meta: match meta {
                    Some(raw) => serde_json::from_str(&raw)?,
                    None => Default::default(),
                },
            });
        }
        Ok(out)
    }
}

impl MeasurementSink for Store {
    fn append(&self, measurement: &Measurement) -> Result<(), DbError> {
        self.add_measurement(measurement).map(|_| ())
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{CheckKind, Diagnostics, Status};
    use chrono::TimeZone;
    use serde_json::Value;
    use tempfile::NamedTempFile;

    fn measurement(target: &str, status: Status, second: u32) -> Measurement {
        let mut meta = Diagnostics::new();
        meta.insert("service_id".into(), Value::String(target.to_string()));
        Measurement {
            ts: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, second).unwrap(),
            region: "EU".to_string(),
            project_id: Some(3),
            target_id: target.to_string(),
            host_id: Some("web-1".to_string()),
            kind: CheckKind::Http,
            status,
            latency_ms: 120,
            meta,
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        store.append(&measurement("svc-a", Status::Ok, 1)).unwrap();
        store.append(&measurement("svc-b", Status::Crit, 2)).unwrap();

        let rows = store.recent_measurements(10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], measurement("svc-b", Status::Crit, 2));
        assert_eq!(rows[1].target_id, "svc-a");
        assert_eq!(rows[1].meta["service_id"], "svc-a");
    }

    #[test]
    fn test_empty_meta_stored_as_null() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let mut m = measurement("svc-a", Status::Warn, 1);
        m.meta.clear();
        m.host_id = None;
        m.project_id = None;
        store.append(&m).unwrap();

        let rows = store.recent_measurements(1).unwrap();
        assert_eq!(rows[0], m);
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = Store::new(tmp.path()).unwrap();
            store.append(&measurement("svc-a", Status::Ok, 1)).unwrap();
        }
        let store = Store::new(tmp.path()).unwrap();
        assert_eq!(store.recent_measurements(5).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_db_time_formats() {
        assert!(parse_db_time("2026-01-02 03:04:05.123").is_some());
        assert!(parse_db_time("2026-01-02 03:04:05").is_some());
        assert!(parse_db_time("2026-01-02T03:04:05Z").is_some());
        assert!(parse_db_time("yesterday").is_none());
    }
}
