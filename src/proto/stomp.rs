//! STOMP 1.2 framing.
//!
//! Frames are text: a command line, header lines, a blank line, then a body
//! terminated by a NUL byte. Bodies we emit always carry `content-length`
//! so binary-safe reads never depend on the NUL scan. Subscription ids and
//! receipts are correlation state shared between the reader and writer
//! halves of a connection.

use crate::endpoint::TransportEndpoint;
use crate::error::{BrokerError, Result};
use crate::proto::{Frame, Role};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Correlation state shared by the two halves of one STOMP connection.
#[derive(Default)]
struct StompShared {
    /// topic -> subscription id, as declared by the peer's SUBSCRIBE.
    sub_ids: HashMap<String, String>,
    /// subscription id -> topic, for UNSUBSCRIBE resolution.
    topics_by_id: HashMap<String, String>,
    /// ack token -> receipt value requested by the peer.
    receipts: HashMap<u64, String>,
}

pub(crate) struct StompReader {
    stream: BufReader<OwnedReadHalf>,
    role: Role,
    shared: Arc<Mutex<StompShared>>,
    next_token: u64,
    max_frame_size: usize,
}

pub(crate) struct StompWriter {
    stream: OwnedWriteHalf,
    role: Role,
    shared: Arc<Mutex<StompShared>>,
    next_message_id: u64,
}

pub(crate) async fn accept(
    stream: TcpStream,
    max_frame_size: usize,
) -> Result<(StompReader, StompWriter)> {
    let (mut reader, mut writer) = split(stream, Role::Server, max_frame_size);

    let connect = read_raw_frame(&mut reader.stream, max_frame_size)
        .await?
        .ok_or(BrokerError::ConnectionClosed)?;
    if connect.command != "CONNECT" && connect.command != "STOMP" {
        return Err(BrokerError::ProtocolError(format!(
            "expected CONNECT, got {}",
            connect.command
        )));
    }

    let connected = RawFrame {
        command: "CONNECTED".to_string(),
        headers: vec![("version".to_string(), "1.2".to_string())],
        body: Vec::new(),
    };
    write_raw_frame(&mut writer.stream, &connected).await?;

    Ok((reader, writer))
}

pub(crate) async fn connect(
    endpoint: &TransportEndpoint,
    max_frame_size: usize,
) -> Result<(StompReader, StompWriter)> {
    let stream = TcpStream::connect(endpoint.authority()).await?;
    let (mut reader, mut writer) = split(stream, Role::Client, max_frame_size);

    let connect = RawFrame {
        command: "CONNECT".to_string(),
        headers: vec![
            ("accept-version".to_string(), "1.2".to_string()),
            ("host".to_string(), endpoint.host.clone()),
        ],
        body: Vec::new(),
    };
    write_raw_frame(&mut writer.stream, &connect).await?;

    let reply = read_raw_frame(&mut reader.stream, max_frame_size)
        .await?
        .ok_or(BrokerError::ConnectionClosed)?;
    if reply.command != "CONNECTED" {
        return Err(BrokerError::ProtocolError(format!(
            "expected CONNECTED, got {}",
            reply.command
        )));
    }

    Ok((reader, writer))
}

fn split(stream: TcpStream, role: Role, max_frame_size: usize) -> (StompReader, StompWriter) {
    let (read_half, write_half) = stream.into_split();
    let shared = Arc::new(Mutex::new(StompShared::default()));
    (
        StompReader {
            stream: BufReader::new(read_half),
            role,
            shared: Arc::clone(&shared),
            next_token: 1,
            max_frame_size,
        },
        StompWriter {
            stream: write_half,
            role,
            shared,
            next_message_id: 1,
        },
    )
}

impl StompReader {
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let Some(raw) = read_raw_frame(&mut self.stream, self.max_frame_size).await? else {
            return Ok(None);
        };
        match self.role {
            Role::Server => self.server_frame(raw).map(Some),
            Role::Client => self.client_frame(raw).map(Some),
        }
    }

    fn server_frame(&mut self, raw: RawFrame) -> Result<Frame> {
        match raw.command.as_str() {
            "SUBSCRIBE" => {
                let topic = required_header(&raw, "destination")?.to_string();
                let id = header(&raw, "id").unwrap_or("0").to_string();
                let token = self.token_for_receipt(&raw);
                let mut shared = self.shared.lock();
                shared.sub_ids.insert(topic.clone(), id.clone());
                shared.topics_by_id.insert(id, topic.clone());
                Ok(Frame::Subscribe { topic, token })
            }
            "UNSUBSCRIBE" => {
                let id = required_header(&raw, "id")?;
                let topic = self
                    .shared
                    .lock()
                    .topics_by_id
                    .remove(id)
                    .ok_or_else(|| {
                        BrokerError::ProtocolError(format!("unknown subscription id: {id}"))
                    })?;
                let token = self.token_for_receipt(&raw);
                self.shared.lock().sub_ids.remove(&topic);
                Ok(Frame::Unsubscribe { topic, token })
            }
            "SEND" => {
                let topic = required_header(&raw, "destination")?.to_string();
                Ok(Frame::Publish {
                    topic,
                    payload: Bytes::from(raw.body),
                })
            }
            "DISCONNECT" => Ok(Frame::Disconnect),
            other => Err(BrokerError::ProtocolError(format!(
                "unexpected frame from client: {other}"
            ))),
        }
    }

    fn client_frame(&mut self, raw: RawFrame) -> Result<Frame> {
        match raw.command.as_str() {
            "MESSAGE" => {
                let topic = required_header(&raw, "destination")?.to_string();
                Ok(Frame::Publish {
                    topic,
                    payload: Bytes::from(raw.body),
                })
            }
            "RECEIPT" => {
                let receipt = required_header(&raw, "receipt-id")?;
                let token = receipt.parse().map_err(|_| {
                    BrokerError::ProtocolError(format!("non-numeric receipt-id: {receipt}"))
                })?;
                Ok(Frame::SubAck { token })
            }
            "ERROR" => {
                let message = header(&raw, "message").unwrap_or("server error");
                Err(BrokerError::ProtocolError(message.to_string()))
            }
            other => Err(BrokerError::ProtocolError(format!(
                "unexpected frame from server: {other}"
            ))),
        }
    }

    /// Allocates an ack token for a frame, remembering the peer's requested
    /// receipt so the writer can answer it. Frames without a receipt get
    /// token 0 and their ack is silently dropped by the writer.
    fn token_for_receipt(&mut self, raw: &RawFrame) -> u64 {
        match header(raw, "receipt") {
            Some(receipt) => {
                let token = self.next_token;
                self.next_token += 1;
                self.shared.lock().receipts.insert(token, receipt.to_string());
                token
            }
            None => 0,
        }
    }
}

impl StompWriter {
    pub(crate) async fn write_frame(&mut self, frame: Frame) -> Result<()> {
        let raw = match (self.role, frame) {
            (Role::Server, Frame::Publish { topic, payload }) => {
                let subscription = self
                    .shared
                    .lock()
                    .sub_ids
                    .get(&topic)
                    .cloned()
                    .unwrap_or_else(|| "0".to_string());
                let message_id = self.next_message_id;
                self.next_message_id += 1;
                RawFrame {
                    command: "MESSAGE".to_string(),
                    headers: vec![
                        ("destination".to_string(), topic),
                        ("message-id".to_string(), message_id.to_string()),
                        ("subscription".to_string(), subscription),
                        ("content-type".to_string(), "application/json".to_string()),
                    ],
                    body: payload.to_vec(),
                }
            }
            (Role::Server, Frame::SubAck { token } | Frame::UnsubAck { token }) => {
                let Some(receipt) = self.shared.lock().receipts.remove(&token) else {
                    return Ok(());
                };
                RawFrame {
                    command: "RECEIPT".to_string(),
                    headers: vec![("receipt-id".to_string(), receipt)],
                    body: Vec::new(),
                }
            }
            (_, Frame::Pong | Frame::Ping) => {
                // STOMP heartbeats are bare newlines.
                self.stream.write_all(b"\n").await?;
                self.stream.flush().await?;
                return Ok(());
            }
            (Role::Server, Frame::Disconnect) => return Ok(()),
            (Role::Client, Frame::Subscribe { topic, token }) => {
                let mut shared = self.shared.lock();
                shared.sub_ids.insert(topic.clone(), token.to_string());
                RawFrame {
                    command: "SUBSCRIBE".to_string(),
                    headers: vec![
                        ("id".to_string(), token.to_string()),
                        ("destination".to_string(), topic),
                        ("ack".to_string(), "auto".to_string()),
                        ("receipt".to_string(), token.to_string()),
                    ],
                    body: Vec::new(),
                }
            }
            (Role::Client, Frame::Unsubscribe { topic, token }) => {
                let id = self
                    .shared
                    .lock()
                    .sub_ids
                    .remove(&topic)
                    .unwrap_or_else(|| "0".to_string());
                RawFrame {
                    command: "UNSUBSCRIBE".to_string(),
                    headers: vec![
                        ("id".to_string(), id),
                        ("receipt".to_string(), token.to_string()),
                    ],
                    body: Vec::new(),
                }
            }
            (Role::Client, Frame::Publish { topic, payload }) => RawFrame {
                command: "SEND".to_string(),
                headers: vec![
                    ("destination".to_string(), topic),
                    ("content-type".to_string(), "application/json".to_string()),
                ],
                body: payload.to_vec(),
            },
            (Role::Client, Frame::Disconnect) => RawFrame {
                command: "DISCONNECT".to_string(),
                headers: Vec::new(),
                body: Vec::new(),
            },
            (role, frame) => {
                return Err(BrokerError::ProtocolError(format!(
                    "frame {frame:?} not valid for {role:?} side"
                )))
            }
        };
        write_raw_frame(&mut self.stream, &raw).await
    }

    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[derive(Debug)]
struct RawFrame {
    command: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

fn header<'a>(raw: &'a RawFrame, name: &str) -> Option<&'a str> {
    // First occurrence wins, per the STOMP spec.
    raw.headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn required_header<'a>(raw: &'a RawFrame, name: &str) -> Result<&'a str> {
    header(raw, name).ok_or_else(|| {
        BrokerError::ProtocolError(format!("{} frame missing {name} header", raw.command))
    })
}

async fn read_raw_frame<R>(stream: &mut R, max_frame_size: usize) -> Result<Option<RawFrame>>
where
    R: AsyncBufRead + Unpin,
{
    // Command line; blank lines between frames are heartbeats.
    let command = loop {
        match read_line(stream, max_frame_size).await? {
            None => return Ok(None),
            Some(line) if line.is_empty() => continue,
            Some(line) => break line,
        }
    };

    let mut headers = Vec::new();
    loop {
        let line = read_line(stream, max_frame_size)
            .await?
            .ok_or(BrokerError::ConnectionClosed)?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            BrokerError::ProtocolError(format!("header without colon: {line}"))
        })?;
        headers.push((name.to_string(), value.to_string()));
    }

    let raw = RawFrame {
        command,
        headers,
        body: Vec::new(),
    };

    let body = if let Some(len) = header(&raw, "content-length") {
        let len: usize = len.parse().map_err(|_| {
            BrokerError::ProtocolError(format!("bad content-length: {len}"))
        })?;
        if len > max_frame_size {
            return Err(BrokerError::FrameTooLarge {
                size: len,
                max: max_frame_size,
            });
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        let mut nul = [0u8; 1];
        stream.read_exact(&mut nul).await?;
        if nul[0] != 0 {
            return Err(BrokerError::ProtocolError(
                "frame body not NUL-terminated".to_string(),
            ));
        }
        body
    } else {
        let mut body = Vec::new();
        let read = stream.read_until(0, &mut body).await?;
        if read == 0 || body.last() != Some(&0) {
            return Err(BrokerError::ConnectionClosed);
        }
        if body.len() > max_frame_size {
            return Err(BrokerError::FrameTooLarge {
                size: body.len(),
                max: max_frame_size,
            });
        }
        body.pop();
        body
    };

    Ok(Some(RawFrame { body, ..raw }))
}

async fn read_line<R>(stream: &mut R, max_frame_size: usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = stream.read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    if line.len() > max_frame_size {
        return Err(BrokerError::FrameTooLarge {
            size: line.len(),
            max: max_frame_size,
        });
    }
    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| BrokerError::ProtocolError("frame line is not UTF-8".to_string()))
}

async fn write_raw_frame<W>(stream: &mut W, raw: &RawFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(64 + raw.body.len());
    out.extend_from_slice(raw.command.as_bytes());
    out.push(b'\n');
    for (name, value) in &raw.headers {
        out.extend_from_slice(name.as_bytes());
        out.push(b':');
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
    if !raw.body.is_empty() {
        out.extend_from_slice(format!("content-length:{}\n", raw.body.len()).as_bytes());
    }
    out.push(b'\n');
    out.extend_from_slice(&raw.body);
    out.push(0);

    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}
