//! # Connections Module
//!
//! Durable storage for the pipeline. The `store` seam is always built, together with the
//! in-memory implementation; the PostgreSQL adapter needs the `connections` feature.

/// The `TelemetryStore` trait and the per-frame commit it consumes.
pub mod store;

/// In-process store for tests and database-less runs.
pub mod memory;

/// PostgreSQL store on a `deadpool-postgres` pool.
#[cfg(feature = "connections")]
pub mod db_postgres;
