//! Measurement storage.
//!
//! The collector only writes through [`MeasurementSink`]; the SQLite
//! [`Store`] is the production implementation.

mod models;
mod store;

pub use models::*;
pub use store::*;

/// Durable, append-only destination for measurements.
pub trait MeasurementSink: Send + Sync {
    /// Write a single measurement.
    fn append(&self, measurement: &Measurement) -> Result<(), DbError>;
}
