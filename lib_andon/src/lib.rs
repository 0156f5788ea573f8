//! # lib_andon
//!
//! Consumer-side processing for the Andon line monitor. Workstations publish a fixed-width
//! status frame on `devices/{stationId}`; this crate turns that stream into durable fault
//! records, per-day downtime aggregates and a live feed for dashboards.
//!
//! ## Folders
//! - **`telemetry`**: frame decoding, per-station state, transition detection and the fault
//!   lifecycle state machine. Pure and synchronous.
//! - **`core`**: the single-consumer `Sequencer`, the broadcast `Dispatcher` and the
//!   dashboard `Reports`.
//! - **`connections`**: the `TelemetryStore` seam, the in-memory store and (feature
//!   `connections`) the PostgreSQL adapter.
//! - **`ingestors`**: reconnect policy and (feature `ingestors`) the Redis pub/sub adapter.

#![forbid(unsafe_code)]

pub mod connections;
pub mod core;
pub mod ingestors;
pub mod telemetry;

// Re-export the types every host needs to wire a pipeline together.
pub use crate::connections::memory::MemoryStore;
pub use crate::connections::store::{
    DowntimeQuery, DowntimeRow, FaultQuery, FrameCommit, ProductionUpdate, StationRow, StoreError, TelemetryStore,
};
pub use crate::core::dispatcher::{Delivery, Dispatcher, StationUpdate};
pub use crate::core::reports::{DashboardSummary, Reports, StationStats};
pub use crate::core::sequencer::{
    FrameOutcome, PipelineError, Sequencer, SequencerClosed, SequencerHandle, SequencerStats, StationBoard,
    StationSummary, StatsSnapshot,
};
pub use crate::ingestors::reconnect::ReconnectPolicy;
pub use crate::ingestors::transport::{TransportError, TransportSnapshot, TransportStatus};
pub use crate::telemetry::{
    Category, CategoryTable, ChannelReading, LayoutError, RawFrame, SignalLevel, StationFrame,
    StationLayout,
};
