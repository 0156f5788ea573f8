//! # Telemetry Store
//!
//! The persistence seam of the pipeline. One [`FrameCommit`] carries every write a single
//! frame produced; an implementation must apply it atomically (all or nothing), since the
//! sequencer only updates its in-memory state once `commit` returned `Ok`.
//!
//! The read side (station rows, downtime aggregates, fault history) serves the dashboard
//! reports and never runs on the sequencer's path.

use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::telemetry::{Category, FaultMutation, FaultRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to connect to the store: {0}")]
    Connection(String),
    #[error("Query execution failed: {0}")]
    Query(String),
    #[error("Store is unavailable: {0}")]
    Unavailable(String),
}

/// New value of a station's production counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductionUpdate {
    pub count: u64,
    pub at: DateTime<Utc>,
}

/// All writes derived from one frame, applied in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameCommit {
    pub station_id: String,
    pub production: Option<ProductionUpdate>,
    pub mutations: Vec<FaultMutation>,
}

impl FrameCommit {
    pub fn new(station_id: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            production: None,
            mutations: Vec::new(),
        }
    }

    /// A commit with nothing to write; the sequencer skips the store round trip for it.
    pub fn is_empty(&self) -> bool {
        self.production.is_none() && self.mutations.is_empty()
    }
}

/// One row of the `stations` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationRow {
    pub station_id: String,
    pub planned_count: u64,
    pub actual_count: u64,
    /// `actual_count / planned_count` in percent; 0 while nothing is planned.
    pub efficiency: f64,
    pub updated_at: DateTime<Utc>,
}

/// Minutes of downtime booked for one `(station, category, day)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DowntimeRow {
    pub station_id: String,
    pub category: Category,
    pub day: NaiveDate,
    pub minutes: f64,
}

/// Filter for [`TelemetryStore::downtime_rows`]. Unset fields match everything; both day
/// bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DowntimeQuery {
    pub station_id: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DowntimeQuery {
    /// Whether `row` falls inside every bound that is set.
    pub fn matches(&self, row: &DowntimeRow) -> bool {
        self.station_id.as_ref().map_or(true, |id| id == &row.station_id)
            && self.from.map_or(true, |from| row.day >= from)
            && self.to.map_or(true, |to| row.day <= to)
    }
}

/// Filter for [`TelemetryStore::fault_history`] on the open time: `opened_from` is
/// inclusive, `opened_before` exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultQuery {
    pub station_id: Option<String>,
    pub opened_from: Option<DateTime<Utc>>,
    pub opened_before: Option<DateTime<Utc>>,
}

impl FaultQuery {
    pub fn matches(&self, record: &FaultRecord) -> bool {
        self.station_id.as_ref().map_or(true, |id| id == &record.station_id)
            && self.opened_from.map_or(true, |from| record.opened_at >= from)
            && self.opened_before.map_or(true, |before| record.opened_at < before)
    }
}

/// Durable storage for production counts, fault records and downtime aggregates.
///
/// Used through generics by the sequencer, so implementations may write `async fn`.
pub trait TelemetryStore: Send + Sync + 'static {
    /// Applies every write of one frame in a single transaction:
    ///
    /// 1. upsert the production count and derived efficiency,
    /// 2. insert each opened fault record,
    /// 3. set `closed_at` on the most recent open record of each closed key,
    /// 4. add each close's minutes to its `(station, category, day)` aggregate.
    fn commit(&self, commit: &FrameCommit) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Every fault record whose `closed_at` is null; at most one per key, the most recent.
    fn load_open_faults(&self) -> impl Future<Output = Result<Vec<FaultRecord>, StoreError>> + Send;

    /// Every station row, ordered by station id.
    fn station_rows(&self) -> impl Future<Output = Result<Vec<StationRow>, StoreError>> + Send;

    /// Aggregate rows matching `query`: newest day first, then by station and category.
    fn downtime_rows(&self, query: &DowntimeQuery) -> impl Future<Output = Result<Vec<DowntimeRow>, StoreError>> + Send;

    /// Fault records matching `query`, most recently opened first.
    fn fault_history(&self, query: &FaultQuery) -> impl Future<Output = Result<Vec<FaultRecord>, StoreError>> + Send;
}
