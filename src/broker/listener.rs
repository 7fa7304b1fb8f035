//! Transport listener accept loops and per-connection sessions.
//!
//! A listener owns one bound endpoint and accepts connections for exactly
//! one protocol family. Each connection runs a session that translates the
//! peer's frames into Topic Bus calls and forwards bus messages back out
//! through the protocol's framing. A failure on one connection never
//! touches another connection or another transport.

use crate::bus::{SubscriptionHandle, TopicBus, TopicMessage};
use crate::config::BrokerConfig;
use crate::endpoint::TransportEndpoint;
use crate::error::{BrokerError, Result};
use crate::proto::{self, Frame, FrameWriter};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Spawns the accept loop for one bound listener.
pub(crate) fn spawn_accept_loop(
    listener: TcpListener,
    endpoint: TransportEndpoint,
    bus: Arc<TopicBus>,
    config: Arc<BrokerConfig>,
    shutdown_tx: broadcast::Sender<()>,
) -> JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!(%endpoint, %peer_addr, "new connection");
                            let bus = Arc::clone(&bus);
                            let config = Arc::clone(&config);
                            let endpoint = endpoint.clone();
                            let shutdown_rx = shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    run_connection(stream, &endpoint, bus, config, shutdown_rx)
                                        .await
                                {
                                    if e.is_normal_disconnect() {
                                        debug!(%endpoint, %peer_addr, "connection finished");
                                    } else {
                                        warn!(%endpoint, %peer_addr, error = %e, "connection failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!(%endpoint, error = %e, "accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!(%endpoint, "accept loop shutting down");
                    break;
                }
            }
        }
    })
}

async fn run_connection(
    stream: TcpStream,
    endpoint: &TransportEndpoint,
    bus: Arc<TopicBus>,
    config: Arc<BrokerConfig>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let (mut reader, writer) = proto::accept(endpoint.scheme, stream, config.max_frame_size).await?;

    // One bounded queue for bus fan-out, one small queue for protocol acks;
    // the writer task drains both.
    let (bus_tx, bus_rx) = flume::bounded::<TopicMessage>(config.channel_capacity);
    let (ctrl_tx, ctrl_rx) = flume::bounded::<Frame>(8);
    let writer_task = tokio::spawn(write_loop(writer, bus_rx, ctrl_rx));

    let label = endpoint.to_string();
    let mut subscriptions: HashMap<String, SubscriptionHandle> = HashMap::new();
    let mut result = Ok(());

    loop {
        tokio::select! {
            maybe_frame = reader.read_frame() => {
                match maybe_frame {
                    Ok(None) => break,
                    Ok(Some(Frame::Subscribe { topic, token })) => {
                        if !subscriptions.contains_key(&topic) {
                            let handle = bus.subscribe(&topic, &label, bus_tx.clone()).await;
                            subscriptions.insert(topic, handle);
                        }
                        if ctrl_tx.send_async(Frame::SubAck { token }).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Frame::Unsubscribe { topic, token })) => {
                        if let Some(handle) = subscriptions.remove(&topic) {
                            if let Err(BrokerError::SubscriptionNotFound(id)) =
                                bus.unsubscribe(&handle).await
                            {
                                debug!(id, "subscription already gone");
                            }
                        }
                        if ctrl_tx.send_async(Frame::UnsubAck { token }).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Frame::Publish { topic, payload })) => {
                        let delivered = bus.publish(&topic, payload).await;
                        trace!(%topic, delivered, "inbound publish routed");
                    }
                    Ok(Some(Frame::Ping)) => {
                        if ctrl_tx.send_async(Frame::Pong).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Frame::Disconnect)) => break,
                    Ok(Some(other)) => {
                        trace!(?other, "ignoring frame");
                    }
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = ctrl_tx.send_async(Frame::Disconnect).await;
                break;
            }
        }
    }

    for (_, handle) in subscriptions.drain() {
        if let Err(BrokerError::SubscriptionNotFound(id)) = bus.unsubscribe(&handle).await {
            debug!(id, "subscription already gone");
        }
    }
    drop(bus_tx);
    drop(ctrl_tx);
    let _ = writer_task.await;

    result
}

/// Drains bus messages and control acks into the wire, in arrival order per
/// queue. Ends when the session drops both senders or the peer is gone.
async fn write_loop(
    mut writer: FrameWriter,
    bus_rx: flume::Receiver<TopicMessage>,
    ctrl_rx: flume::Receiver<Frame>,
) {
    loop {
        let frame = tokio::select! {
            msg = bus_rx.recv_async() => match msg {
                Ok(message) => Frame::Publish {
                    topic: message.topic,
                    payload: message.payload,
                },
                Err(_) => break,
            },
            ctl = ctrl_rx.recv_async() => match ctl {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };
        let disconnect = matches!(frame, Frame::Disconnect);
        if let Err(e) = writer.write_frame(frame).await {
            if !e.is_normal_disconnect() {
                debug!(error = %e, "outbound write failed");
            }
            break;
        }
        if disconnect {
            break;
        }
    }
    let _ = writer.shutdown().await;
}
