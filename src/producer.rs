//! Typed JSON producer handle.

use crate::codec;
use crate::config::DEFAULT_MAX_FRAME_SIZE;
use crate::endpoint::TransportEndpoint;
use crate::error::{BrokerError, Result};
use crate::proto::{self, Frame, FrameWriter};
use crate::value::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

/// Publishes JSON-encoded values to one topic over one transport
/// connection.
///
/// `send` failures are surfaced synchronously to the caller; nothing is
/// queued past the wire write. Closing releases only this producer's own
/// connection.
pub struct JsonProducer {
    endpoint: TransportEndpoint,
    topic: String,
    writer: Mutex<FrameWriter>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl JsonProducer {
    pub(crate) async fn connect(
        endpoint: TransportEndpoint,
        topic: &str,
        concurrency_hint: usize,
    ) -> Result<Self> {
        let (reader, writer) = proto::connect(&endpoint, DEFAULT_MAX_FRAME_SIZE).await?;
        // Producers never subscribe, so the broker has nothing to say to
        // them past the handshake.
        drop(reader);
        debug!(%endpoint, topic, "producer connected");
        Ok(Self {
            endpoint,
            topic: topic.to_string(),
            writer: Mutex::new(writer),
            permits: Arc::new(Semaphore::new(concurrency_hint.max(1))),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn endpoint(&self) -> &TransportEndpoint {
        &self.endpoint
    }

    /// Encodes `value` as JSON and publishes it to this producer's topic.
    ///
    /// At most `concurrency_hint` callers are in flight at once; the rest
    /// wait here.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` after close, or the transport error if the
    /// write fails.
    pub async fn send(&self, value: &Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::InvalidState("producer is closed".to_string()));
        }
        let payload = codec::encode(value);

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BrokerError::InvalidState("producer is closed".to_string()))?;
        let mut writer = self.writer.lock().await;
        writer
            .write_frame(Frame::Publish {
                topic: self.topic.clone(),
                payload,
            })
            .await
    }

    /// Closes the producer's connection. Idempotent, and safe to call after
    /// the broker has already stopped.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_frame(Frame::Disconnect).await {
            debug!(error = %e, "disconnect frame not delivered");
        }
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "connection shutdown failed");
        }
        debug!(endpoint = %self.endpoint, topic = %self.topic, "producer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerController;

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let mut broker = BrokerController::new(["tcp://127.0.0.1:0"]).unwrap();
        broker.start_embedded_broker().await.unwrap();
        let url = broker.bound_endpoints()[0].to_string();

        let producer = BrokerController::create_json_producer(&url, "/topic/a", 1)
            .await
            .unwrap();
        producer.send(&Value::from("ok")).await.unwrap();

        producer.close().await;
        producer.close().await;

        let err = producer.send(&Value::from("late")).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidState(_)));

        broker.stop_embedded_broker().await;
    }

    #[tokio::test]
    async fn test_close_after_broker_stop_is_quiet() {
        let mut broker = BrokerController::new(["stomp://127.0.0.1:0"]).unwrap();
        broker.start_embedded_broker().await.unwrap();
        let url = broker.bound_endpoints()[0].to_string();

        let producer = BrokerController::create_json_producer(&url, "/topic/a", 1)
            .await
            .unwrap();
        broker.stop_embedded_broker().await;

        producer.close().await;
    }
}
