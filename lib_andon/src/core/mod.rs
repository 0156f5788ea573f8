//! # Core Engine Module
//!
//! The moving parts of the pipeline: the single-consumer `Sequencer` that applies frames in
//! arrival order, and the `Dispatcher` that fans committed changes out to live subscribers.
//!
//! ## Core Components:
//!
//! - **`sequencer`**: owns the per-station state and the fault index; decode, diff, commit,
//!   apply and broadcast happen here, one frame at a time.
//! - **`dispatcher`**: non-blocking fan-out with per-subscriber bounded queues and lag
//!   notices.
//! - **`reports`**: read-only dashboard views over the store.

/// The non-blocking broadcaster for station updates.
pub mod dispatcher;
/// Dashboard reports built from the store.
pub mod reports;
/// The ordered single-consumer frame processor.
pub mod sequencer;

// --- Public API Re-exports ---
pub use dispatcher::{Delivery, Dispatcher, StationUpdate};
pub use reports::{DashboardSummary, Reports, StationStats};
pub use sequencer::{
    FrameOutcome, PipelineError, Sequencer, SequencerClosed, SequencerHandle, SequencerStats, StationBoard,
    StationSummary, StatsSnapshot,
};
