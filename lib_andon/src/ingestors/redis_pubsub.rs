//! # Redis Pub/Sub Ingestor
//!
//! Pattern-subscribes to `{prefix}/*` and hands every message to the sequencer as a
//! `RawFrame`, stamped with the local receipt time.
//!
//! A lost connection is retried under the configured [`ReconnectPolicy`]; the attempt
//! counter starts over after each successful subscribe. Messages published while the
//! connection was down are not replayed.

use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::core::sequencer::SequencerHandle;
use crate::ingestors::reconnect::ReconnectPolicy;
use crate::ingestors::transport::{parse_topic, TransportError, TransportStatus};
use crate::telemetry::RawFrame;

/// How a connected session ended.
enum SessionEnd {
    Shutdown,
    SequencerClosed,
    ConnectionLost,
}

/// Pattern subscriber on `{prefix}/*` that feeds the sequencer.
pub struct RedisIngestor {
    client: redis::Client,
    prefix: String,
    policy: ReconnectPolicy,
    status: Arc<TransportStatus>,
}

impl RedisIngestor {
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    /// * `prefix` - Topic prefix; stations publish on `{prefix}/{stationId}`.
    pub fn new(url: &str, prefix: &str, policy: ReconnectPolicy) -> Result<Self, TransportError> {
        let client = redis::Client::open(url).map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.trim_end_matches('/').to_string(),
            policy,
            status: Arc::new(TransportStatus::default()),
        })
    }

    /// Shared connection state, for the status endpoint.
    pub fn status(&self) -> Arc<TransportStatus> {
        Arc::clone(&self.status)
    }

    fn pattern(&self) -> String {
        format!("{}/*", self.prefix)
    }

    /// Runs until `shutdown` fires (`Ok`), the sequencer goes away (`Ok`), or the reconnect
    /// ceiling is reached (`TransportError::Fatal`).
    pub async fn run(&self, handle: SequencerHandle, shutdown: CancellationToken) -> Result<(), TransportError> {
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            log::info!("Subscribing to {} on Redis", self.pattern());
            match self.subscribe().await {
                Ok(mut pubsub) => {
                    attempt = 0;
                    self.status.mark_connected();
                    log::info!("Subscribed to {}", self.pattern());

                    let end = self.pump(&mut pubsub, &handle, &shutdown).await;
                    self.status.mark_disconnected();
                    match end {
                        SessionEnd::Shutdown => {
                            log::info!("Ingestor shutting down.");
                            return Ok(());
                        }
                        SessionEnd::SequencerClosed => {
                            log::info!("Sequencer closed; ingestor stopping.");
                            return Ok(());
                        }
                        SessionEnd::ConnectionLost => log::warn!("Redis pub/sub connection lost."),
                    }
                }
                Err(e) => log::error!("Failed to subscribe: {}", e),
            }

            attempt += 1;
            if !self.policy.allows(attempt) {
                log::error!("Giving up after {} reconnect attempt(s).", self.policy.max_attempts);
                return Err(TransportError::Fatal {
                    attempts: self.policy.max_attempts,
                });
            }
            self.status.set_reconnect_attempt(attempt);

            let delay = self.policy.delay_for(attempt);
            log::warn!(
                "Reconnect attempt {}/{} in {} ms.",
                attempt,
                self.policy.max_attempts,
                delay.as_millis()
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn subscribe(&self) -> Result<redis::aio::PubSub, TransportError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        pubsub
            .psubscribe(self.pattern())
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(pubsub)
    }

    async fn pump(
        &self,
        pubsub: &mut redis::aio::PubSub,
        handle: &SequencerHandle,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let mut messages = std::pin::pin!(pubsub.on_message());

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                msg = messages.next() => msg,
            };
            let Some(msg) = next else {
                return SessionEnd::ConnectionLost;
            };

            let received_at = Utc::now();
            match parse_topic(&self.prefix, msg.get_channel_name()) {
                Ok(station_id) => {
                    let raw = RawFrame::new(station_id, msg.get_payload_bytes(), received_at);
                    if handle.submit(raw).is_err() {
                        return SessionEnd::SequencerClosed;
                    }
                }
                Err(e) => log::debug!("Ignoring message: {}", e),
            }
        }
    }
}
