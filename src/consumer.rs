//! Typed JSON consumer handle.

use crate::codec;
use crate::config::DEFAULT_MAX_FRAME_SIZE;
use crate::endpoint::TransportEndpoint;
use crate::error::{BrokerError, Result};
use crate::proto::{self, Frame, FrameReader, FrameWriter};
use crate::value::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

const SUBSCRIBE_TOKEN: u64 = 1;
const UNSUBSCRIBE_TOKEN: u64 = 2;
const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Callback invoked once per received value.
pub type ConsumerCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Receives JSON-encoded values from one topic over one transport
/// connection and hands each decoded value to a callback.
///
/// Callbacks run on a worker pool sized by the consumer's
/// `concurrency_hint`; the pool's feed queue is bounded, so a slow callback
/// backpressures this consumer's own delivery path and nothing else.
/// Payloads that fail to decode are reported on [`JsonConsumer::errors`]
/// and dropped.
pub struct JsonConsumer {
    endpoint: TransportEndpoint,
    topic: String,
    writer: Arc<Mutex<FrameWriter>>,
    reader_task: JoinHandle<()>,
    error_rx: flume::Receiver<BrokerError>,
    closed: AtomicBool,
}

impl JsonConsumer {
    pub(crate) async fn connect<F>(
        endpoint: TransportEndpoint,
        topic: &str,
        callback: F,
        concurrency_hint: usize,
    ) -> Result<Self>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let (mut reader, mut writer) = proto::connect(&endpoint, DEFAULT_MAX_FRAME_SIZE).await?;

        writer
            .write_frame(Frame::Subscribe {
                topic: topic.to_string(),
                token: SUBSCRIBE_TOKEN,
            })
            .await?;
        wait_for_subscribe_ack(&mut reader).await?;
        debug!(%endpoint, topic, "consumer subscribed");

        let callback: ConsumerCallback = Arc::new(callback);
        let workers = concurrency_hint.max(1);
        let (work_tx, work_rx) = flume::bounded::<Value>(workers);
        let (error_tx, error_rx) = flume::bounded::<BrokerError>(ERROR_CHANNEL_CAPACITY);

        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let callback = Arc::clone(&callback);
            tokio::spawn(async move {
                while let Ok(value) = work_rx.recv_async().await {
                    callback(value);
                }
            });
        }

        let reader_task = tokio::spawn(read_loop(reader, work_tx, error_tx));

        Ok(Self {
            endpoint,
            topic: topic.to_string(),
            writer: Arc::new(Mutex::new(writer)),
            reader_task,
            error_rx,
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

    /// Receiver for this consumer's error channel: malformed payloads and
    /// unexpected transport failures land here without stopping anything
    /// else.
    #[must_use]
    pub fn errors(&self) -> flume::Receiver<BrokerError> {
        self.error_rx.clone()
    }

    /// Unsubscribes and closes this consumer's connection. The broker's
    /// Topic Bus and listeners are untouched. Idempotent, and safe to call
    /// after the broker has already stopped.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut writer = self.writer.lock().await;
            let unsubscribe = Frame::Unsubscribe {
                topic: self.topic.clone(),
                token: UNSUBSCRIBE_TOKEN,
            };
            if let Err(e) = writer.write_frame(unsubscribe).await {
                debug!(error = %e, "unsubscribe frame not delivered");
            }
            if let Err(e) = writer.write_frame(Frame::Disconnect).await {
                debug!(error = %e, "disconnect frame not delivered");
            }
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "connection shutdown failed");
            }
        }
        // Dropping the reader releases the worker feed; workers drain what
        // is already queued and exit.
        self.reader_task.abort();
        debug!(endpoint = %self.endpoint, topic = %self.topic, "consumer closed");
    }
}

impl Drop for JsonConsumer {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn wait_for_subscribe_ack(reader: &mut FrameReader) -> Result<()> {
    let ack = timeout(SUBSCRIBE_ACK_TIMEOUT, async {
        loop {
            match reader.read_frame().await? {
                Some(Frame::SubAck {
                    token: SUBSCRIBE_TOKEN,
                }) => return Ok(()),
                Some(other) => {
                    debug!(?other, "frame before subscription ack");
                }
                None => return Err(BrokerError::ConnectionClosed),
            }
        }
    })
    .await;
    match ack {
        Ok(result) => result,
        Err(_) => Err(BrokerError::TransportIo(
            "timed out waiting for subscription ack".to_string(),
        )),
    }
}

async fn read_loop(
    mut reader: FrameReader,
    work_tx: flume::Sender<Value>,
    error_tx: flume::Sender<BrokerError>,
) {
    loop {
        match reader.read_frame().await {
            Ok(Some(Frame::Publish { payload, .. })) => match codec::decode(&payload) {
                Ok(value) => {
                    // Bounded feed: blocks here when every worker is busy
                    // and the queue is full.
                    if work_tx.send_async(value).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "dropping undecodable message");
                    let _ = error_tx.try_send(e);
                }
            },
            Ok(Some(Frame::Disconnect)) | Ok(None) => break,
            Ok(Some(_)) => {}
            Err(e) => {
                if !e.is_normal_disconnect() {
                    let _ = error_tx.try_send(e);
                }
                break;
            }
        }
    }
}
