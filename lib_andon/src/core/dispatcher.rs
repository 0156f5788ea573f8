//! # Broadcast Dispatcher
//!
//! Fans station updates out to every live subscriber (in practice, WebSocket sessions).
//!
//! ## Design
//!
//! 1.  **Shared payload**: an update is wrapped in an `Arc` once; each subscriber receives a
//!     pointer to the same allocation.
//! 2.  **Never blocks the caller**: every subscriber owns a bounded queue and delivery uses
//!     `try_send`. A full queue drops the event for that subscriber only.
//! 3.  **Lag accounting**: dropped events are counted per subscriber and the count rides on
//!     the next [`Delivery`] that fits. One event never needs more than one queue slot, so a
//!     subscriber that drains its queue always receives the following update, whatever the
//!     queue capacity.
//! 4.  **Cleanup**: subscribers whose receiver is gone are removed during the fan-out.

#![warn(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::telemetry::FaultChange;

/// Queue capacity used by [`Dispatcher::default`].
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// The `station_updates` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationUpdate {
    /// Always `station_updates`.
    pub r#type: &'static str,
    /// Station whose frame produced the update.
    pub station_id: String,
    /// Fault openings and closings, in channel order.
    pub changes: Vec<FaultChange>,
    /// Production counter carried by the frame that produced this update.
    pub production_count: u64,
}

impl StationUpdate {
    /// Builds a `station_updates` event.
    pub fn new(station_id: impl Into<String>, changes: Vec<FaultChange>, production_count: u64) -> Self {
        Self {
            r#type: "station_updates",
            station_id: station_id.into(),
            changes,
            production_count,
        }
    }
}

/// What a subscriber pulls off its queue: one update, plus the number of events dropped for
/// this subscriber right before it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The shared event.
    pub update: Arc<StationUpdate>,
    /// Events dropped for this subscriber since its previous delivery.
    pub missed: u64,
}

impl Delivery {
    /// The JSON text messages for a WebSocket client, in send order.
    ///
    /// # Returns
    /// A `{"type":"lagged","missed":n}` notice when events were missed, followed by the
    /// update itself.
    pub fn to_json_messages(&self) -> Result<Vec<String>, serde_json::Error> {
        let mut messages = Vec::with_capacity(2);
        if self.missed > 0 {
            messages.push(serde_json::to_string(&LaggedNotice {
                r#type: "lagged",
                missed: self.missed,
            })?);
        }
        messages.push(serde_json::to_string(self.update.as_ref())?);
        Ok(messages)
    }
}

#[derive(Serialize)]
struct LaggedNotice {
    r#type: &'static str,
    missed: u64,
}

struct ClientHandle {
    id: String,
    sender: mpsc::Sender<Delivery>,
    /// Events dropped since the last successful delivery.
    missed: u64,
}

/// Manages registration and fan-out for all subscribers.
pub struct Dispatcher {
    clients: Mutex<Vec<ClientHandle>>,
    buffer: usize,
    dropped_total: AtomicU64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl Dispatcher {
    /// Creates a dispatcher with no subscribers.
    ///
    /// # Arguments
    /// * `buffer` - Per-subscriber queue capacity; zero is raised to one.
    pub fn new(buffer: usize) -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Registers a subscriber and returns the receiving half of its queue.
    pub fn add_client(&self, id: &str) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.lock().push(ClientHandle {
            id: id.to_string(),
            sender: tx,
            missed: 0,
        });
        log::info!("Client '{}' registered with the dispatcher", id);
        rx
    }

    /// Removes a specific client by its ID.
    pub fn remove_client(&self, id: &str) {
        self.lock().retain(|c| c.id != id);
        log::info!("Client '{}' explicitly removed.", id);
    }

    /// Number of registered subscribers, including ones not yet pruned.
    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    /// Events dropped across all subscribers since startup.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Offers `update` to every subscriber without waiting on any of them.
    ///
    /// # Returns
    /// The number of subscribers that accepted it.
    pub fn broadcast(&self, update: StationUpdate) -> usize {
        let update = Arc::new(update);
        let mut delivered = 0;
        let mut clients = self.lock();

        clients.retain_mut(|client| {
            let delivery = Delivery {
                update: Arc::clone(&update),
                missed: client.missed,
            };
            match client.sender.try_send(delivery) {
                Ok(()) => {
                    client.missed = 0;
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    client.missed += 1;
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Client '{}' queue is full; {} event(s) missed.", client.id, client.missed);
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    log::info!("Client '{}' disconnected. Removing from dispatcher.", client.id);
                    false
                }
            }
        });

        delivered
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ClientHandle>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }
}
