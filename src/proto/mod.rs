//! Wire protocol families.
//!
//! Each submodule implements one protocol's framing over a common `Frame`
//! operation set, for both the accepting (broker) and connecting (client)
//! side of a connection. Everything above this layer is protocol-agnostic.

pub(crate) mod binary;
pub(crate) mod mqtt;
pub(crate) mod stomp;
pub(crate) mod ws;

use crate::endpoint::{Scheme, TransportEndpoint};
use crate::error::Result;
use bytes::Bytes;
use tokio::net::TcpStream;

/// Protocol-independent operation carried by every protocol family.
///
/// `token` is the protocol's correlation id for request/ack pairs (MQTT
/// packet id, STOMP receipt). Protocols without acks ignore it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    Subscribe { topic: String, token: u64 },
    Unsubscribe { topic: String, token: u64 },
    Publish { topic: String, payload: Bytes },
    SubAck { token: u64 },
    UnsubAck { token: u64 },
    Ping,
    Pong,
    Disconnect,
}

/// Which side of the connection a frame codec is speaking for. STOMP and
/// the WebSocket envelope frame the same operation differently per role
/// (SEND vs MESSAGE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Server,
    Client,
}

pub(crate) enum FrameReader {
    Stomp(stomp::StompReader),
    Binary(binary::BinaryReader),
    Ws(ws::WsReader),
    Mqtt(mqtt::MqttReader),
}

impl FrameReader {
    /// Reads the next frame. `Ok(None)` means the peer closed cleanly.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Frame>> {
        match self {
            Self::Stomp(r) => r.read_frame().await,
            Self::Binary(r) => r.read_frame().await,
            Self::Ws(r) => r.read_frame().await,
            Self::Mqtt(r) => r.read_frame().await,
        }
    }
}

pub(crate) enum FrameWriter {
    Stomp(stomp::StompWriter),
    Binary(binary::BinaryWriter),
    Ws(ws::WsWriter),
    Mqtt(mqtt::MqttWriter),
}

impl FrameWriter {
    pub(crate) async fn write_frame(&mut self, frame: Frame) -> Result<()> {
        match self {
            Self::Stomp(w) => w.write_frame(frame).await,
            Self::Binary(w) => w.write_frame(frame).await,
            Self::Ws(w) => w.write_frame(frame).await,
            Self::Mqtt(w) => w.write_frame(frame).await,
        }
    }

    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        match self {
            Self::Stomp(w) => w.shutdown().await,
            Self::Binary(w) => w.shutdown().await,
            Self::Ws(w) => w.shutdown().await,
            Self::Mqtt(w) => w.shutdown().await,
        }
    }
}

/// Performs the protocol's server-side handshake on an accepted connection
/// and splits it into frame reader/writer halves.
pub(crate) async fn accept(
    scheme: Scheme,
    stream: TcpStream,
    max_frame_size: usize,
) -> Result<(FrameReader, FrameWriter)> {
    match scheme {
        Scheme::Stomp => {
            let (r, w) = stomp::accept(stream, max_frame_size).await?;
            Ok((FrameReader::Stomp(r), FrameWriter::Stomp(w)))
        }
        Scheme::Tcp => {
            let (r, w) = binary::accept(stream, max_frame_size);
            Ok((FrameReader::Binary(r), FrameWriter::Binary(w)))
        }
        Scheme::Ws => {
            let (r, w) = ws::accept(stream, max_frame_size).await?;
            Ok((FrameReader::Ws(r), FrameWriter::Ws(w)))
        }
        Scheme::Mqtt => {
            let (r, w) = mqtt::accept(stream, max_frame_size).await?;
            Ok((FrameReader::Mqtt(r), FrameWriter::Mqtt(w)))
        }
    }
}

/// Connects to a broker endpoint, performs the protocol's client-side
/// handshake, and splits the connection into frame reader/writer halves.
pub(crate) async fn connect(
    endpoint: &TransportEndpoint,
    max_frame_size: usize,
) -> Result<(FrameReader, FrameWriter)> {
    match endpoint.scheme {
        Scheme::Stomp => {
            let (r, w) = stomp::connect(endpoint, max_frame_size).await?;
            Ok((FrameReader::Stomp(r), FrameWriter::Stomp(w)))
        }
        Scheme::Tcp => {
            let (r, w) = binary::connect(endpoint, max_frame_size).await?;
            Ok((FrameReader::Binary(r), FrameWriter::Binary(w)))
        }
        Scheme::Ws => {
            let (r, w) = ws::connect(endpoint, max_frame_size).await?;
            Ok((FrameReader::Ws(r), FrameWriter::Ws(w)))
        }
        Scheme::Mqtt => {
            let (r, w) = mqtt::connect(endpoint, max_frame_size).await?;
            Ok((FrameReader::Mqtt(r), FrameWriter::Mqtt(w)))
        }
    }
}
