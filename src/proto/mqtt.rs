//! MQTT 3.1.1 framing, QoS 0 subset.
//!
//! Fixed header with variable-byte remaining length, u16-length-prefixed
//! strings. Covers CONNECT/CONNACK, SUBSCRIBE/SUBACK, UNSUBSCRIBE/UNSUBACK,
//! PUBLISH, PINGREQ/PINGRESP and DISCONNECT. Publishes arriving with QoS
//! above 0 are delivered once and not acknowledged; QoS negotiation is out
//! of scope.

use crate::endpoint::TransportEndpoint;
use crate::error::{BrokerError, Result};
use crate::proto::{Frame, Role};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const UNSUBSCRIBE: u8 = 10;
const UNSUBACK: u8 = 11;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct MqttReader {
    stream: OwnedReadHalf,
    role: Role,
    max_frame_size: usize,
    /// A SUBSCRIBE/UNSUBSCRIBE packet can carry several filters; extras
    /// are queued here and drained before the next wire read.
    pending: VecDeque<Frame>,
}

pub(crate) struct MqttWriter {
    stream: OwnedWriteHalf,
    role: Role,
}

pub(crate) async fn accept(
    stream: TcpStream,
    max_frame_size: usize,
) -> Result<(MqttReader, MqttWriter)> {
    let (mut reader, mut writer) = split(stream, Role::Server, max_frame_size);

    let (first_byte, body) = reader
        .read_packet()
        .await?
        .ok_or(BrokerError::ConnectionClosed)?;
    if first_byte >> 4 != CONNECT {
        return Err(BrokerError::ProtocolError(format!(
            "expected CONNECT, got packet type {}",
            first_byte >> 4
        )));
    }
    parse_connect(body)?;

    // CONNACK: session-present 0, return code 0.
    writer.write_packet(CONNACK << 4, &[0x00, 0x00]).await?;

    Ok((reader, writer))
}

pub(crate) async fn connect(
    endpoint: &TransportEndpoint,
    max_frame_size: usize,
) -> Result<(MqttReader, MqttWriter)> {
    let stream = TcpStream::connect(endpoint.authority()).await?;
    let (mut reader, mut writer) = split(stream, Role::Client, max_frame_size);

    let client_id = format!("polybus-{}", NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst));
    let mut body = BytesMut::new();
    put_string(&mut body, "MQTT")?;
    body.put_u8(0x04); // protocol level 3.1.1
    body.put_u8(0x02); // clean session
    body.put_u16(0); // keep alive disabled
    put_string(&mut body, &client_id)?;
    writer.write_packet(CONNECT << 4, &body).await?;

    let (first_byte, mut ack) = reader
        .read_packet()
        .await?
        .ok_or(BrokerError::ConnectionClosed)?;
    if first_byte >> 4 != CONNACK {
        return Err(BrokerError::ProtocolError(format!(
            "expected CONNACK, got packet type {}",
            first_byte >> 4
        )));
    }
    if ack.remaining() < 2 {
        return Err(BrokerError::ProtocolError("short CONNACK".to_string()));
    }
    ack.advance(1); // session present flag
    let return_code = ack.get_u8();
    if return_code != 0 {
        return Err(BrokerError::ProtocolError(format!(
            "connection refused: return code {return_code}"
        )));
    }

    Ok((reader, writer))
}

fn split(stream: TcpStream, role: Role, max_frame_size: usize) -> (MqttReader, MqttWriter) {
    let (read_half, write_half) = stream.into_split();
    (
        MqttReader {
            stream: read_half,
            role,
            max_frame_size,
            pending: VecDeque::new(),
        },
        MqttWriter {
            stream: write_half,
            role,
        },
    )
}

impl MqttReader {
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }

        let Some((first_byte, body)) = self.read_packet().await? else {
            return Ok(None);
        };
        match self.role {
            Role::Server => self.server_frame(first_byte, body),
            Role::Client => self.client_frame(first_byte, body),
        }
    }

    async fn read_packet(&mut self) -> Result<Option<(u8, Bytes)>> {
        let first_byte = match self.stream.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut remaining: usize = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.stream.read_u8().await?;
            remaining |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 21 {
                return Err(BrokerError::ProtocolError(
                    "remaining length exceeds four bytes".to_string(),
                ));
            }
        }
        if remaining > self.max_frame_size {
            return Err(BrokerError::FrameTooLarge {
                size: remaining,
                max: self.max_frame_size,
            });
        }

        let mut body = vec![0u8; remaining];
        self.stream.read_exact(&mut body).await?;
        Ok(Some((first_byte, Bytes::from(body))))
    }

    fn server_frame(&mut self, first_byte: u8, mut body: Bytes) -> Result<Option<Frame>> {
        match first_byte >> 4 {
            SUBSCRIBE => {
                let pid = take_u16(&mut body)?;
                let mut topics = Vec::new();
                while body.has_remaining() {
                    let topic = take_string(&mut body)?;
                    let _requested_qos = take_u8(&mut body)?;
                    topics.push(topic);
                }
                if topics.is_empty() {
                    return Err(BrokerError::ProtocolError(
                        "SUBSCRIBE without topic filter".to_string(),
                    ));
                }
                // The ack token rides on the last filter so a single SUBACK
                // goes out once every filter is registered.
                let last = topics.len() - 1;
                for (i, topic) in topics.into_iter().enumerate() {
                    let token = if i == last { u64::from(pid) } else { 0 };
                    self.pending.push_back(Frame::Subscribe { topic, token });
                }
                Ok(self.pending.pop_front())
            }
            UNSUBSCRIBE => {
                let pid = take_u16(&mut body)?;
                let mut topics = Vec::new();
                while body.has_remaining() {
                    topics.push(take_string(&mut body)?);
                }
                if topics.is_empty() {
                    return Err(BrokerError::ProtocolError(
                        "UNSUBSCRIBE without topic filter".to_string(),
                    ));
                }
                let last = topics.len() - 1;
                for (i, topic) in topics.into_iter().enumerate() {
                    let token = if i == last { u64::from(pid) } else { 0 };
                    self.pending.push_back(Frame::Unsubscribe { topic, token });
                }
                Ok(self.pending.pop_front())
            }
            PUBLISH => Ok(Some(parse_publish(first_byte, body)?)),
            PINGREQ => Ok(Some(Frame::Ping)),
            DISCONNECT => Ok(Some(Frame::Disconnect)),
            other => Err(BrokerError::ProtocolError(format!(
                "unexpected packet type from client: {other}"
            ))),
        }
    }

    fn client_frame(&mut self, first_byte: u8, mut body: Bytes) -> Result<Option<Frame>> {
        match first_byte >> 4 {
            SUBACK => {
                let pid = take_u16(&mut body)?;
                while body.has_remaining() {
                    let code = take_u8(&mut body)?;
                    if code >= 0x80 {
                        return Err(BrokerError::ProtocolError(format!(
                            "subscription rejected: return code {code:#04x}"
                        )));
                    }
                }
                Ok(Some(Frame::SubAck {
                    token: u64::from(pid),
                }))
            }
            UNSUBACK => {
                let pid = take_u16(&mut body)?;
                Ok(Some(Frame::UnsubAck {
                    token: u64::from(pid),
                }))
            }
            PUBLISH => Ok(Some(parse_publish(first_byte, body)?)),
            PINGRESP => Ok(Some(Frame::Pong)),
            other => Err(BrokerError::ProtocolError(format!(
                "unexpected packet type from server: {other}"
            ))),
        }
    }
}

impl MqttWriter {
    pub(crate) async fn write_frame(&mut self, frame: Frame) -> Result<()> {
        match (self.role, frame) {
            (_, Frame::Publish { topic, payload }) => {
                let mut body = BytesMut::with_capacity(2 + topic.len() + payload.len());
                put_string(&mut body, &topic)?;
                body.extend_from_slice(&payload);
                self.write_packet(PUBLISH << 4, &body).await
            }
            (Role::Server, Frame::SubAck { token }) => {
                let mut body = BytesMut::new();
                body.put_u16(token as u16);
                body.put_u8(0x00); // granted QoS 0
                self.write_packet(SUBACK << 4, &body).await
            }
            (Role::Server, Frame::UnsubAck { token }) => {
                let mut body = BytesMut::new();
                body.put_u16(token as u16);
                self.write_packet(UNSUBACK << 4, &body).await
            }
            (Role::Server, Frame::Pong) => self.write_packet(PINGRESP << 4, &[]).await,
            (Role::Server, Frame::Disconnect) => Ok(()),
            (Role::Client, Frame::Subscribe { topic, token }) => {
                let mut body = BytesMut::new();
                body.put_u16(token as u16);
                put_string(&mut body, &topic)?;
                body.put_u8(0x00); // requested QoS 0
                self.write_packet(SUBSCRIBE << 4 | 0x02, &body).await
            }
            (Role::Client, Frame::Unsubscribe { topic, token }) => {
                let mut body = BytesMut::new();
                body.put_u16(token as u16);
                put_string(&mut body, &topic)?;
                self.write_packet(UNSUBSCRIBE << 4 | 0x02, &body).await
            }
            (Role::Client, Frame::Ping) => self.write_packet(PINGREQ << 4, &[]).await,
            (Role::Client, Frame::Disconnect) => self.write_packet(DISCONNECT << 4, &[]).await,
            (role, frame) => Err(BrokerError::ProtocolError(format!(
                "frame {frame:?} not valid for {role:?} side"
            ))),
        }
    }

    async fn write_packet(&mut self, first_byte: u8, body: &[u8]) -> Result<()> {
        let mut out = BytesMut::with_capacity(5 + body.len());
        out.put_u8(first_byte);
        let mut remaining = body.len();
        loop {
            let mut byte = (remaining % 128) as u8;
            remaining /= 128;
            if remaining > 0 {
                byte |= 0x80;
            }
            out.put_u8(byte);
            if remaining == 0 {
                break;
            }
        }
        out.extend_from_slice(body);
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn parse_publish(first_byte: u8, mut body: Bytes) -> Result<Frame> {
    let qos = (first_byte >> 1) & 0x03;
    if qos > 2 {
        return Err(BrokerError::ProtocolError("invalid QoS bits".to_string()));
    }
    let topic = take_string(&mut body)?;
    if qos > 0 {
        // Consume the packet id; delivery stays unacknowledged.
        let _pid = take_u16(&mut body)?;
        trace!(%topic, qos, "publish above QoS 0 delivered without ack");
    }
    Ok(Frame::Publish {
        topic,
        payload: body,
    })
}

fn parse_connect(mut body: Bytes) -> Result<()> {
    let name = take_string(&mut body)?;
    if name != "MQTT" {
        return Err(BrokerError::ProtocolError(format!(
            "unknown protocol name: {name}"
        )));
    }
    let level = take_u8(&mut body)?;
    if level != 0x04 {
        return Err(BrokerError::ProtocolError(format!(
            "unsupported protocol level: {level}"
        )));
    }
    let flags = take_u8(&mut body)?;
    let _keep_alive = take_u16(&mut body)?;
    let _client_id = take_string(&mut body)?;
    if flags & 0x04 != 0 {
        // Will topic and payload; accepted and ignored.
        let _will_topic = take_string(&mut body)?;
        let _will_payload = take_bytes(&mut body)?;
    }
    if flags & 0x80 != 0 {
        let _username = take_string(&mut body)?;
    }
    if flags & 0x40 != 0 {
        let _password = take_bytes(&mut body)?;
    }
    Ok(())
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| BrokerError::ProtocolError("string exceeds 65535 bytes".to_string()))?;
    buf.put_u16(len);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn take_u8(buf: &mut Bytes) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(BrokerError::ProtocolError("truncated packet".to_string()));
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(BrokerError::ProtocolError("truncated packet".to_string()));
    }
    Ok(buf.get_u16())
}

fn take_bytes(buf: &mut Bytes) -> Result<Bytes> {
    let len = take_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(BrokerError::ProtocolError("truncated packet".to_string()));
    }
    Ok(buf.split_to(len))
}

fn take_string(buf: &mut Bytes) -> Result<String> {
    let bytes = take_bytes(buf)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| BrokerError::ProtocolError("string is not UTF-8".to_string()))
}
