//! Length-prefixed binary framing over raw TCP.
//!
//! Frame layout: `u32` big-endian length of the remainder, `u8` opcode,
//! then an opcode-specific body. Topics are `u16`-length-prefixed UTF-8;
//! the publish payload is the rest of the frame. There is no connection
//! handshake.

use crate::endpoint::TransportEndpoint;
use crate::error::{BrokerError, Result};
use crate::proto::Frame;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const OP_SUBSCRIBE: u8 = 0x01;
const OP_UNSUBSCRIBE: u8 = 0x02;
const OP_PUBLISH: u8 = 0x03;
const OP_SUBACK: u8 = 0x04;
const OP_UNSUBACK: u8 = 0x05;
const OP_PING: u8 = 0x06;
const OP_PONG: u8 = 0x07;
const OP_DISCONNECT: u8 = 0x08;

pub(crate) struct BinaryReader {
    stream: OwnedReadHalf,
    max_frame_size: usize,
}

pub(crate) struct BinaryWriter {
    stream: OwnedWriteHalf,
}

pub(crate) fn accept(stream: TcpStream, max_frame_size: usize) -> (BinaryReader, BinaryWriter) {
    split(stream, max_frame_size)
}

pub(crate) async fn connect(
    endpoint: &TransportEndpoint,
    max_frame_size: usize,
) -> Result<(BinaryReader, BinaryWriter)> {
    let stream = TcpStream::connect(endpoint.authority()).await?;
    Ok(split(stream, max_frame_size))
}

fn split(stream: TcpStream, max_frame_size: usize) -> (BinaryReader, BinaryWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        BinaryReader {
            stream: read_half,
            max_frame_size,
        },
        BinaryWriter { stream: write_half },
    )
}

impl BinaryReader {
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let len = match self.stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > self.max_frame_size {
            return Err(BrokerError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        if len == 0 {
            return Err(BrokerError::ProtocolError("empty frame".to_string()));
        }

        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        decode_frame(Bytes::from(body)).map(Some)
    }
}

impl BinaryWriter {
    pub(crate) async fn write_frame(&mut self, frame: Frame) -> Result<()> {
        let body = encode_frame(&frame)?;
        let mut out = BytesMut::with_capacity(4 + body.len());
        out.put_u32(u32::try_from(body.len()).map_err(|_| BrokerError::FrameTooLarge {
            size: body.len(),
            max: u32::MAX as usize,
        })?);
        out.extend_from_slice(&body);
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn encode_frame(frame: &Frame) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    match frame {
        Frame::Subscribe { topic, token } => {
            buf.put_u8(OP_SUBSCRIBE);
            buf.put_u64(*token);
            put_topic(&mut buf, topic)?;
        }
        Frame::Unsubscribe { topic, token } => {
            buf.put_u8(OP_UNSUBSCRIBE);
            buf.put_u64(*token);
            put_topic(&mut buf, topic)?;
        }
        Frame::Publish { topic, payload } => {
            buf.put_u8(OP_PUBLISH);
            put_topic(&mut buf, topic)?;
            buf.extend_from_slice(payload);
        }
        Frame::SubAck { token } => {
            buf.put_u8(OP_SUBACK);
            buf.put_u64(*token);
        }
        Frame::UnsubAck { token } => {
            buf.put_u8(OP_UNSUBACK);
            buf.put_u64(*token);
        }
        Frame::Ping => buf.put_u8(OP_PING),
        Frame::Pong => buf.put_u8(OP_PONG),
        Frame::Disconnect => buf.put_u8(OP_DISCONNECT),
    }
    Ok(buf)
}

fn decode_frame(mut buf: Bytes) -> Result<Frame> {
    let opcode = buf.get_u8();
    match opcode {
        OP_SUBSCRIBE => {
            let token = take_u64(&mut buf)?;
            let topic = take_topic(&mut buf)?;
            Ok(Frame::Subscribe { topic, token })
        }
        OP_UNSUBSCRIBE => {
            let token = take_u64(&mut buf)?;
            let topic = take_topic(&mut buf)?;
            Ok(Frame::Unsubscribe { topic, token })
        }
        OP_PUBLISH => {
            let topic = take_topic(&mut buf)?;
            Ok(Frame::Publish {
                topic,
                payload: buf,
            })
        }
        OP_SUBACK => Ok(Frame::SubAck {
            token: take_u64(&mut buf)?,
        }),
        OP_UNSUBACK => Ok(Frame::UnsubAck {
            token: take_u64(&mut buf)?,
        }),
        OP_PING => Ok(Frame::Ping),
        OP_PONG => Ok(Frame::Pong),
        OP_DISCONNECT => Ok(Frame::Disconnect),
        other => Err(BrokerError::ProtocolError(format!(
            "unknown opcode: {other:#04x}"
        ))),
    }
}

fn put_topic(buf: &mut BytesMut, topic: &str) -> Result<()> {
    let len = u16::try_from(topic.len())
        .map_err(|_| BrokerError::ProtocolError("topic exceeds 65535 bytes".to_string()))?;
    buf.put_u16(len);
    buf.extend_from_slice(topic.as_bytes());
    Ok(())
}

fn take_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(BrokerError::ProtocolError("truncated frame".to_string()));
    }
    Ok(buf.get_u64())
}

fn take_topic(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(BrokerError::ProtocolError("truncated frame".to_string()));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(BrokerError::ProtocolError("truncated topic".to_string()));
    }
    let topic = buf.split_to(len);
    String::from_utf8(topic.to_vec())
        .map_err(|_| BrokerError::ProtocolError("topic is not UTF-8".to_string()))
}
