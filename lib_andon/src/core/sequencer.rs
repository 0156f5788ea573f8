//! # Sequencer
//!
//! The single consumer of the pipeline. Raw frames from the transport are queued on an
//! unbounded channel; one worker takes them in arrival order and runs each through
//! decode, diff, fault planning, one store commit, state update and broadcast before looking
//! at the next. Frame application is therefore globally ordered, which also orders every
//! station's own frames.
//!
//! The station state and the fault index are owned by the worker. Both are updated only
//! after the store commit succeeded, so a failed commit leaves the worker exactly where it
//! was and a redelivery of the same frame derives the same writes again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connections::store::{FrameCommit, ProductionUpdate, StoreError, TelemetryStore};
use crate::core::dispatcher::{Dispatcher, StationUpdate};
use crate::telemetry::{
    Category, ChannelTransition, FaultChange, FaultRecord, FaultTracker, FrameDecoder, FrameError, RawFrame,
    StationFrame, StationLayout, StationStateStore, TransitionDetector,
};

/// Why a single frame was not applied. Neither stops the worker loop.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Malformed(#[from] FrameError),
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

/// Returned by [`SequencerHandle::submit`] once the worker has shut down.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("sequencer is shut down")]
pub struct SequencerClosed;

/// Live counters, shared between the worker and any number of handles.
#[derive(Debug, Default)]
pub struct SequencerStats {
    queued: AtomicUsize,
    processing: AtomicBool,
    processed: AtomicU64,
    malformed: AtomicU64,
    persistence_failures: AtomicU64,
    orphan_closes: AtomicU64,
    dropped_on_shutdown: AtomicU64,
    stations: AtomicUsize,
}

/// Point-in-time copy of [`SequencerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub queued: usize,
    pub processing: bool,
    pub processed: u64,
    pub malformed: u64,
    pub persistence_failures: u64,
    pub orphan_closes: u64,
    pub dropped_on_shutdown: u64,
    pub stations: usize,
}

impl SequencerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            processing: self.processing.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            orphan_closes: self.orphan_closes.load(Ordering::Relaxed),
            dropped_on_shutdown: self.dropped_on_shutdown.load(Ordering::Relaxed),
            stations: self.stations.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view of one station for the status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationSummary {
    pub station_id: String,
    pub production_count: u64,
    pub open_faults: Vec<Category>,
    pub last_frame_at: DateTime<Utc>,
}

/// Per-station summaries, written by the worker after each committed frame.
#[derive(Debug, Default)]
pub struct StationBoard {
    stations: RwLock<BTreeMap<String, StationSummary>>,
}

impl StationBoard {
    pub fn get(&self, station_id: &str) -> Option<StationSummary> {
        self.stations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(station_id)
            .cloned()
    }

    /// All stations, sorted by id.
    pub fn snapshot(&self) -> Vec<StationSummary> {
        self.stations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn put(&self, summary: StationSummary) {
        self.stations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(summary.station_id.clone(), summary);
    }
}

/// Cloneable producer side of the queue.
#[derive(Debug, Clone)]
pub struct SequencerHandle {
    tx: mpsc::UnboundedSender<RawFrame>,
    stats: Arc<SequencerStats>,
    board: Arc<StationBoard>,
}

impl SequencerHandle {
    /// Enqueues a frame. Never waits.
    pub fn submit(&self, raw: RawFrame) -> Result<(), SequencerClosed> {
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        self.tx.send(raw).map_err(|_| {
            self.stats.queued.fetch_sub(1, Ordering::Relaxed);
            SequencerClosed
        })
    }

    /// Counters as of now.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Latest summary per station, updated after every committed frame.
    pub fn board(&self) -> &StationBoard {
        &self.board
    }

    /// Whether the sequencer has stopped accepting frames.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// What applying one frame did.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub station_id: String,
    pub transitions: Vec<ChannelTransition>,
    pub changes: Vec<FaultChange>,
    pub production: Option<u64>,
    pub orphan_closes: usize,
    /// Whether a `station_updates` event was published.
    pub broadcast: bool,
}

pub struct Sequencer<S: TelemetryStore> {
    rx: mpsc::UnboundedReceiver<RawFrame>,
    layout: StationLayout,
    decoder: FrameDecoder,
    detector: TransitionDetector,
    states: StationStateStore,
    tracker: FaultTracker,
    store: Arc<S>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<SequencerStats>,
    board: Arc<StationBoard>,
}

impl<S: TelemetryStore> Sequencer<S> {
    /// Builds the worker and its first handle. `timezone` decides which calendar day a
    /// closed fault's downtime is booked on.
    pub fn new(
        layout: StationLayout,
        timezone: Tz,
        store: Arc<S>,
        dispatcher: Arc<Dispatcher>,
    ) -> (Self, SequencerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(SequencerStats::default());
        let board = Arc::new(StationBoard::default());

        let handle = SequencerHandle {
            tx,
            stats: Arc::clone(&stats),
            board: Arc::clone(&board),
        };
        let sequencer = Self {
            rx,
            decoder: FrameDecoder::new(layout.channel_count()),
            detector: TransitionDetector::new(layout.production_channel(), layout.channel_count()),
            states: StationStateStore::new(),
            tracker: FaultTracker::new(layout.categories().clone(), timezone),
            layout,
            store,
            dispatcher,
            stats,
            board,
        };
        (sequencer, handle)
    }

    /// Rebuilds in-memory state from the store's open fault records: the tracker learns each
    /// open record and the record's channel is marked asserted, so the first live frame with
    /// that channel back at normal closes it. Returns the number of records seeded.
    pub async fn rehydrate(&mut self) -> Result<usize, StoreError> {
        let records = self.store.load_open_faults().await?;
        let channel_count = self.layout.channel_count();

        let mut known: Vec<FaultRecord> = Vec::with_capacity(records.len());
        for record in records {
            match self.layout.categories().channel_for(&record.category) {
                Some(channel) => {
                    self.states
                        .seed_asserted(&record.station_id, channel, record.opened_at, channel_count);
                    known.push(record);
                }
                None => log::warn!(
                    "Open {} record for station {} has no channel in the category table; ignoring it.",
                    record.category,
                    record.station_id
                ),
            }
        }

        let station_ids: Vec<String> = known.iter().map(|r| r.station_id.clone()).collect();
        let seeded = self.tracker.seed(known);
        for station_id in station_ids {
            if let Some(frame) = self.states.get(&station_id) {
                let summary = self.summarize(frame);
                self.board.put(summary);
            }
        }
        self.stats.stations.store(self.states.len(), Ordering::Relaxed);

        log::info!("Rehydrated {} open fault record(s) across {} station(s).", seeded, self.states.len());
        Ok(seeded)
    }

    /// Runs the worker until `shutdown` fires or every handle is dropped. The frame in flight
    /// is finished; frames still queued are discarded and counted as dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        log::info!("Sequencer started.");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                raw = self.rx.recv() => raw,
            };
            let Some(raw) = next else {
                break;
            };

            self.stats.queued.fetch_sub(1, Ordering::Relaxed);
            self.stats.processing.store(true, Ordering::Relaxed);
            match self.process(raw).await {
                Ok(_) => {}
                Err(PipelineError::Malformed(e)) => log::warn!("Discarding frame: {}", e),
                Err(e @ PipelineError::Persistence(_)) => log::error!("Frame not applied: {}", e),
            }
            self.stats.processing.store(false, Ordering::Relaxed);
        }

        self.rx.close();
        let mut dropped = 0u64;
        while let Ok(raw) = self.rx.try_recv() {
            self.stats.queued.fetch_sub(1, Ordering::Relaxed);
            log::debug!("Dropping queued frame from station {} at shutdown.", raw.station_id);
            dropped += 1;
        }
        self.stats.dropped_on_shutdown.fetch_add(dropped, Ordering::Relaxed);
        if dropped > 0 {
            log::warn!("Sequencer stopped with {} queued frame(s) dropped.", dropped);
        } else {
            log::info!("Sequencer stopped.");
        }
    }

    /// Applies one frame end to end.
    pub async fn process(&mut self, raw: RawFrame) -> Result<FrameOutcome, PipelineError> {
        let frame = match self.decoder.decode(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                return Err(PipelineError::Malformed(e));
            }
        };
        let station_id = frame.station_id.clone();
        let at = frame.received_at;

        let previous = self.states.get(&station_id);
        let transitions = self.detector.detect(previous, &frame);
        let production = self.detector.production_update(previous, &frame);
        let plan = self.tracker.plan(&station_id, &transitions, at);

        let commit = FrameCommit {
            station_id: station_id.clone(),
            production: production.map(|count| ProductionUpdate { count, at }),
            mutations: plan.mutations.clone(),
        };
        if !commit.is_empty() {
            if let Err(e) = self.store.commit(&commit).await {
                self.stats.persistence_failures.fetch_add(1, Ordering::Relaxed);
                return Err(PipelineError::Persistence(e));
            }
        }

        // Committed: now the in-memory side may follow.
        self.tracker.apply(&plan);
        let summary = self.summarize(&frame);
        self.states.set(frame);
        self.board.put(summary.clone());
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.stats.orphan_closes.fetch_add(plan.orphans.len() as u64, Ordering::Relaxed);
        self.stats.stations.store(self.states.len(), Ordering::Relaxed);

        let broadcast = !plan.changes.is_empty() || production.is_some();
        if broadcast {
            let update = StationUpdate::new(station_id.clone(), plan.changes.clone(), summary.production_count);
            let delivered = self.dispatcher.broadcast(update);
            log::debug!("Station {} update delivered to {} subscriber(s).", station_id, delivered);
        }

        Ok(FrameOutcome {
            station_id,
            transitions,
            changes: plan.changes,
            production,
            orphan_closes: plan.orphans.len(),
            broadcast,
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn states(&self) -> &StationStateStore {
        &self.states
    }

    pub fn tracker(&self) -> &FaultTracker {
        &self.tracker
    }

    fn summarize(&self, frame: &StationFrame) -> StationSummary {
        StationSummary {
            station_id: frame.station_id.clone(),
            production_count: frame
                .reading(self.layout.production_channel())
                .map(|r| r.counter)
                .unwrap_or(0),
            open_faults: self.tracker.open_categories(&frame.station_id),
            last_frame_at: frame.received_at,
        }
    }
}
