//! # Data Ingestors Module
//!
//! The front door of the pipeline: subscribes to station topics and feeds raw frames into
//! the sequencer.
//!
//! ## Contained Modules:
//! - **`reconnect`**: bounded exponential backoff.
//! - **`transport`**: topic parsing, `TransportError` and the shared `TransportStatus`.
//! - **`redis_pubsub`** (feature `ingestors`): the Redis `PSUBSCRIBE` client.

/// Reconnect backoff policy.
pub mod reconnect;
/// Transport-neutral topic parsing, errors and status.
pub mod transport;
/// Redis pub/sub client.
#[cfg(feature = "ingestors")]
pub mod redis_pubsub;

// --- Public API Re-exports ---
pub use reconnect::ReconnectPolicy;
pub use transport::{parse_topic, TransportError, TransportSnapshot, TransportStatus};
#[cfg(feature = "ingestors")]
pub use redis_pubsub::RedisIngestor;
