use lib_andon::{StatsSnapshot, TransportSnapshot};
use serde::Serialize;

/// First message on every WebSocket session.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub r#type: &'static str,
    pub status: &'static str,
    pub timestamp: String,
}

impl ConnectionStatus {
    pub fn connected() -> Self {
        Self {
            r#type: "connection_status",
            status: "connected",
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub transport: TransportSnapshot,
    pub sequencer: StatsSnapshot,
    pub subscribers: usize,
    pub dropped_events: u64,
}

/// Body of every failed report request.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub error: String,
}

impl ErrorReport {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}
