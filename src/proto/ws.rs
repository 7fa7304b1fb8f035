//! WebSocket transport with a tagged JSON control envelope.
//!
//! Each WebSocket text message is one envelope; the publish payload rides
//! inside it as the codec's JSON text. Subscribe/unsubscribe are
//! acknowledged with `subscribed`/`unsubscribed` envelopes.

use crate::endpoint::TransportEndpoint;
use crate::error::{BrokerError, Result};
use crate::proto::{Frame, Role};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope {
    Subscribe { topic: String, token: u64 },
    Unsubscribe { topic: String, token: u64 },
    Publish { topic: String, payload: String },
    Subscribed { token: u64 },
    Unsubscribed { token: u64 },
    Message { topic: String, payload: String },
    Disconnect,
}

pub(crate) struct WsReader {
    stream: SplitStream<WsStream>,
    role: Role,
    max_frame_size: usize,
}

pub(crate) struct WsWriter {
    sink: SplitSink<WsStream, Message>,
    role: Role,
}

pub(crate) async fn accept(
    stream: TcpStream,
    max_frame_size: usize,
) -> Result<(WsReader, WsWriter)> {
    let ws = tokio_tungstenite::accept_async(MaybeTlsStream::Plain(stream))
        .await
        .map_err(|e| BrokerError::ProtocolError(format!("WebSocket handshake failed: {e}")))?;
    Ok(split(ws, Role::Server, max_frame_size))
}

pub(crate) async fn connect(
    endpoint: &TransportEndpoint,
    max_frame_size: usize,
) -> Result<(WsReader, WsWriter)> {
    let url = format!("ws://{}/", endpoint.authority());
    let (ws, _response) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| BrokerError::TransportIo(format!("WebSocket connect failed: {e}")))?;
    Ok(split(ws, Role::Client, max_frame_size))
}

fn split(ws: WsStream, role: Role, max_frame_size: usize) -> (WsReader, WsWriter) {
    let (sink, stream) = ws.split();
    (
        WsReader {
            stream,
            role,
            max_frame_size,
        },
        WsWriter { sink, role },
    )
}

impl WsReader {
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let message = match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(message)) => message,
                Some(Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)) => {
                    return Ok(None)
                }
                Some(Err(e)) => return Err(BrokerError::TransportIo(e.to_string())),
            };

            match message {
                Message::Text(text) => {
                    if text.len() > self.max_frame_size {
                        return Err(BrokerError::FrameTooLarge {
                            size: text.len(),
                            max: self.max_frame_size,
                        });
                    }
                    let envelope: Envelope = serde_json::from_str(&text)
                        .map_err(|e| BrokerError::ProtocolError(format!("bad envelope: {e}")))?;
                    return self.frame_from_envelope(envelope).map(Some);
                }
                Message::Close(_) => return Ok(None),
                // tungstenite answers pings on flush; binary and pong
                // frames have no meaning in this envelope protocol.
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
            }
        }
    }

    fn frame_from_envelope(&self, envelope: Envelope) -> Result<Frame> {
        let frame = match (self.role, envelope) {
            (Role::Server, Envelope::Subscribe { topic, token }) => {
                Frame::Subscribe { topic, token }
            }
            (Role::Server, Envelope::Unsubscribe { topic, token }) => {
                Frame::Unsubscribe { topic, token }
            }
            (Role::Server, Envelope::Publish { topic, payload }) => Frame::Publish {
                topic,
                payload: Bytes::from(payload.into_bytes()),
            },
            (_, Envelope::Disconnect) => Frame::Disconnect,
            (Role::Client, Envelope::Message { topic, payload }) => Frame::Publish {
                topic,
                payload: Bytes::from(payload.into_bytes()),
            },
            (Role::Client, Envelope::Subscribed { token }) => Frame::SubAck { token },
            (Role::Client, Envelope::Unsubscribed { token }) => Frame::UnsubAck { token },
            (role, envelope) => {
                return Err(BrokerError::ProtocolError(format!(
                    "envelope {envelope:?} not valid for {role:?} side"
                )))
            }
        };
        Ok(frame)
    }
}

impl WsWriter {
    pub(crate) async fn write_frame(&mut self, frame: Frame) -> Result<()> {
        let envelope = match (self.role, frame) {
            (Role::Server, Frame::Publish { topic, payload }) => Envelope::Message {
                topic,
                payload: payload_text(payload)?,
            },
            (Role::Server, Frame::SubAck { token }) => Envelope::Subscribed { token },
            (Role::Server, Frame::UnsubAck { token }) => Envelope::Unsubscribed { token },
            (Role::Client, Frame::Subscribe { topic, token }) => {
                Envelope::Subscribe { topic, token }
            }
            (Role::Client, Frame::Unsubscribe { topic, token }) => {
                Envelope::Unsubscribe { topic, token }
            }
            (Role::Client, Frame::Publish { topic, payload }) => Envelope::Publish {
                topic,
                payload: payload_text(payload)?,
            },
            (_, Frame::Disconnect) => Envelope::Disconnect,
            (_, Frame::Ping | Frame::Pong) => return Ok(()),
            (role, frame) => {
                return Err(BrokerError::ProtocolError(format!(
                    "frame {frame:?} not valid for {role:?} side"
                )))
            }
        };
        let text = serde_json::to_string(&envelope)
            .map_err(|e| BrokerError::ProtocolError(e.to_string()))?;
        self.sink
            .send(Message::text(text))
            .await
            .map_err(|e| BrokerError::TransportIo(e.to_string()))
    }

    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| BrokerError::TransportIo(e.to_string()))
    }
}

fn payload_text(payload: Bytes) -> Result<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|_| BrokerError::ProtocolError("payload is not UTF-8".to_string()))
}
