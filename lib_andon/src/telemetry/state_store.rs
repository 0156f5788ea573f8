//! Per-station last-applied frame.
//!
//! Owned by the sequencer worker and accessed from that single task only, so there is no
//! internal locking.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::{SignalLevel, StationFrame};

#[derive(Debug, Default)]
pub struct StationStateStore {
    frames: HashMap<String, StationFrame>,
}

impl StationStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-applied frame, or `None` for a station that has never been applied. Callers treat
    /// `None` as the implicit all-normal default.
    pub fn get(&self, station_id: &str) -> Option<&StationFrame> {
        self.frames.get(station_id)
    }

    /// Replaces the last frame of `frame.station_id`.
    pub fn set(&mut self, frame: StationFrame) {
        self.frames.insert(frame.station_id.clone(), frame);
    }

    /// Marks `channel` asserted in the station's stored frame, creating an all-normal frame
    /// first when the station is unknown. Used when rebuilding state from open fault records,
    /// so the first live frame after a restart can close a fault opened before it.
    pub fn seed_asserted(
        &mut self,
        station_id: &str,
        channel: usize,
        at: DateTime<Utc>,
        channel_count: usize,
    ) {
        let frame = self
            .frames
            .entry(station_id.to_string())
            .or_insert_with(|| StationFrame::all_normal(station_id, channel_count, at));
        if let Some(reading) = frame.readings.get_mut(channel) {
            reading.level = SignalLevel::Asserted;
        }
        if at > frame.received_at {
            frame.received_at = at;
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Ids of every station seen so far, in no particular order.
    pub fn station_ids(&self) -> impl Iterator<Item = &str> {
        self.frames.keys().map(String::as_str)
    }
}
