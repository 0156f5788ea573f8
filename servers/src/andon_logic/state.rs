use lib_andon::{Dispatcher, Reports, SequencerHandle, TelemetryStore, TransportStatus};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything the HTTP handlers read. Cheap to clone.
pub struct ServerState<S: TelemetryStore> {
    // Fan-out for `station_updates` events
    pub dispatcher: Arc<Dispatcher>,
    // Live counters and the station board of the sequencer
    pub sequencer: SequencerHandle,
    // Broker connection state written by the ingestor
    pub transport: Arc<TransportStatus>,
    // Read side over the persisted tables
    pub reports: Reports<S>,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}

// Manual impl: the store itself sits behind an Arc and need not be Clone.
impl<S: TelemetryStore> Clone for ServerState<S> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            sequencer: self.sequencer.clone(),
            transport: Arc::clone(&self.transport),
            reports: self.reports.clone(),
            started_at: self.started_at,
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: TelemetryStore> ServerState<S> {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        sequencer: SequencerHandle,
        transport: Arc<TransportStatus>,
        reports: Reports<S>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            sequencer,
            transport,
            reports,
            started_at: Instant::now(),
            shutdown,
        }
    }
}
