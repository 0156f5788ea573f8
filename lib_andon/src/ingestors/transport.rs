//! Transport-neutral pieces of the ingest side: topic parsing, the error taxonomy and the
//! connection status shared with the status endpoint.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::Serialize;
use thiserror::Error;

/// Failures of a transport adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Message on a channel that does not name a station; ignored by the adapter.
    #[error("unknown station topic '{0}'")]
    UnknownStationTopic(String),
    /// The reconnect ceiling was reached. The host is expected to shut down.
    #[error("transport gave up after {attempts} reconnect attempt(s)")]
    Fatal { attempts: u32 },
    #[error("transport connection failed: {0}")]
    Connection(String),
}

/// Extracts the station id from `{prefix}/{stationId}`.
pub fn parse_topic<'a>(prefix: &str, topic: &'a str) -> Result<&'a str, TransportError> {
    topic
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|station| !station.is_empty() && !station.contains('/'))
        .ok_or_else(|| TransportError::UnknownStationTopic(topic.to_string()))
}

/// Live connection state, written by the adapter.
#[derive(Debug, Default)]
pub struct TransportStatus {
    connected: AtomicBool,
    reconnect_attempt: AtomicU32,
}

/// Point-in-time copy of [`TransportStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSnapshot {
    pub connected: bool,
    pub reconnect_attempt: u32,
}

impl TransportStatus {
    /// Records a live subscription and resets the attempt counter.
    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
        self.reconnect_attempt.store(0, Ordering::Relaxed);
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn set_reconnect_attempt(&self, attempt: u32) {
        self.reconnect_attempt.store(attempt, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            reconnect_attempt: self.reconnect_attempt.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topic() {
        assert_eq!(parse_topic("devices", "devices/12"), Ok("12"));
        assert_eq!(parse_topic("devices", "devices/line-a"), Ok("line-a"));

        for bad in ["devices", "devices/", "devices/1/extra", "devicesX/1", "other/1"] {
            assert_eq!(
                parse_topic("devices", bad),
                Err(TransportError::UnknownStationTopic(bad.to_string())),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_status_resets_attempts_on_connect() {
        let status = TransportStatus::default();
        status.set_reconnect_attempt(3);
        assert_eq!(status.snapshot(), TransportSnapshot { connected: false, reconnect_attempt: 3 });

        status.mark_connected();
        assert_eq!(status.snapshot(), TransportSnapshot { connected: true, reconnect_attempt: 0 });

        status.mark_disconnected();
        assert!(!status.snapshot().connected);
    }
}
