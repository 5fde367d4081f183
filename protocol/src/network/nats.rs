//! # NATS Transport
//!
//! A minimal client for the NATS text protocol over plain TCP. Only the
//! operations the mesh needs are implemented:
//!
//! ```text
//! server → client   INFO {json}  MSG <subject> <sid> [reply] <len>  PING  PONG  +OK  -ERR '<msg>'
//! client → server   CONNECT {json}  PUB <subject> <len>  SUB <subject> <sid>  UNSUB <sid>  PING  PONG
//! ```
//!
//! Connection sequence: read `INFO`, send `CONNECT` (auth token and
//! `name = peer_id`) followed by `PING`, then wait for `PONG`. An `-ERR`
//! before the `PONG` means the server refused the credentials.
//!
//! After the handshake a reader task owns the read half. It forwards `MSG`
//! payloads into the link's inbound channel, answers server `PING`s and
//! completes client `PING`s in FIFO order. When the socket ends the task
//! exits and drops the channel sender, which closes the link.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::handshake::Handshake;
use super::transport::{
    BrokerMessage, Connector, Endpoint, Link, Scheme, Transport, TransportError, LINK_BUFFER,
};
use crate::config::{DEFAULT_CONNECT_TIMEOUT, MAX_PAYLOAD_BYTES, PROTOCOL_VERSION};

/// Longest control line accepted from the server.
const MAX_CONTROL_LINE: usize = 4096;

/// How long a client `PING` may wait for its `PONG`.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Subset of the server `INFO` document we care about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub max_payload: Option<usize>,
    #[serde(default)]
    pub auth_required: bool,
}

#[derive(Debug, Serialize)]
struct ConnectOptions<'a> {
    verbose: bool,
    pedantic: bool,
    lang: &'static str,
    version: &'static str,
    protocol: u8,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token: Option<&'a str>,
}

/// One parsed server control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Info(ServerInfo),
    Msg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        len: usize,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Parses a single control line (without the trailing CRLF).
pub fn parse_server_op(line: &str) -> Result<ServerOp, TransportError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (op, rest) = match line.split_once(' ') {
        Some((op, rest)) => (op, rest.trim()),
        None => (line, ""),
    };
    match op.to_ascii_uppercase().as_str() {
        "INFO" => serde_json::from_str(rest)
            .map(ServerOp::Info)
            .map_err(|e| TransportError::Protocol(format!("bad INFO: {e}"))),
        "MSG" => {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            let (subject, sid, reply, len) = match parts.as_slice() {
                [subject, sid, len] => (*subject, *sid, None, *len),
                [subject, sid, reply, len] => (*subject, *sid, Some(reply.to_string()), *len),
                _ => return Err(TransportError::Protocol(format!("bad MSG line: {line:?}"))),
            };
            let sid = sid
                .parse()
                .map_err(|_| TransportError::Protocol(format!("bad sid in {line:?}")))?;
            let len = len
                .parse()
                .map_err(|_| TransportError::Protocol(format!("bad length in {line:?}")))?;
            Ok(ServerOp::Msg {
                subject: subject.to_string(),
                sid,
                reply,
                len,
            })
        }
        "PING" => Ok(ServerOp::Ping),
        "PONG" => Ok(ServerOp::Pong),
        "+OK" => Ok(ServerOp::Ok),
        "-ERR" => Ok(ServerOp::Err(rest.trim_matches('\'').to_string())),
        other => Err(TransportError::Protocol(format!("unknown operation {other:?}"))),
    }
}

/// Reads one control line. At most `MAX_CONTROL_LINE + 1` bytes are
/// buffered; a server sending more without a newline is cut off.
async fn read_op<R>(reader: &mut R) -> Result<ServerOp, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader
        .take(MAX_CONTROL_LINE as u64 + 1)
        .read_line(&mut line)
        .await?;
    if n == 0 {
        return Err(TransportError::Closed);
    }
    if n > MAX_CONTROL_LINE {
        return Err(TransportError::Protocol(format!(
            "control line exceeds {MAX_CONTROL_LINE} bytes"
        )));
    }
    let op = parse_server_op(&line)?;
    if let ServerOp::Msg { len, .. } = &op {
        if *len > MAX_PAYLOAD_BYTES {
            return Err(TransportError::Protocol(format!(
                "message of {len} bytes exceeds {MAX_PAYLOAD_BYTES}"
            )));
        }
    }
    Ok(op)
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Opens NATS links over TCP.
#[derive(Debug, Clone)]
pub struct NatsConnector {
    connect_timeout: Duration,
}

impl Default for NatsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl NatsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn open(&self, endpoint: &Endpoint, hello: &Handshake) -> Result<Link, TransportError> {
        let stream = TcpStream::connect(endpoint.socket_addr())
            .await
            .map_err(|e| TransportError::Unreachable(format!("{endpoint}: {e}")))?;
        stream.set_nodelay(true)?;
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let info = match read_op(&mut reader).await? {
            ServerOp::Info(info) => info,
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected INFO, got {other:?}"
                )))
            }
        };
        debug!(server = %info.server_id, version = %info.version, "nats: server info");
        if info.auth_required && hello.token.is_none() {
            return Err(TransportError::Rejected(
                "server requires authentication but no token is configured".into(),
            ));
        }

        let options = ConnectOptions {
            verbose: false,
            pedantic: false,
            lang: "rust",
            version: PROTOCOL_VERSION,
            protocol: 1,
            name: hello.peer_id().as_str(),
            auth_token: hello.token.as_deref(),
        };
        let connect = serde_json::to_string(&options)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        write
            .write_all(format!("CONNECT {connect}\r\nPING\r\n").as_bytes())
            .await?;
        write.flush().await?;

        loop {
            match read_op(&mut reader).await? {
                ServerOp::Pong => break,
                ServerOp::Ok | ServerOp::Info(_) => continue,
                ServerOp::Ping => write.write_all(b"PONG\r\n").await?,
                ServerOp::Err(msg) => return Err(TransportError::Rejected(msg)),
                ServerOp::Msg { .. } => {
                    return Err(TransportError::Protocol("MSG before handshake completed".into()))
                }
            }
        }

        let max_payload = info
            .max_payload
            .unwrap_or(MAX_PAYLOAD_BYTES)
            .min(MAX_PAYLOAD_BYTES);
        let (tx, rx) = mpsc::channel(LINK_BUFFER);
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(write),
            sids: Mutex::new(HashMap::new()),
            pongs: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        });
        let reader_task = tokio::spawn(read_loop(reader, shared.clone(), tx));

        Ok(Link {
            transport: Arc::new(NatsTransport {
                endpoint: endpoint.clone(),
                shared,
                next_sid: AtomicU64::new(1),
                max_payload,
                reader_task: Mutex::new(Some(reader_task)),
            }),
            inbound: rx,
        })
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self, endpoint: &Endpoint, hello: &Handshake) -> Result<Link, TransportError> {
        if endpoint.scheme() != Scheme::Nats {
            return Err(TransportError::Unreachable(endpoint.to_string()));
        }
        tokio::time::timeout(self.connect_timeout, self.open(endpoint, hello))
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

struct Shared {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// subject → sid
    sids: Mutex<HashMap<String, u64>>,
    pongs: Mutex<VecDeque<oneshot::Sender<()>>>,
    closed: AtomicBool,
}

impl Shared {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    shared: Arc<Shared>,
    tx: mpsc::Sender<BrokerMessage>,
) {
    loop {
        let op = match read_op(&mut reader).await {
            Ok(op) => op,
            Err(TransportError::Closed) => {
                debug!("nats: server closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "nats: read failed");
                break;
            }
        };
        match op {
            ServerOp::Msg {
                subject, sid, len, ..
            } => {
                let mut buf = vec![0u8; len + 2];
                if let Err(e) = reader.read_exact(&mut buf).await {
                    warn!(error = %e, "nats: truncated message payload");
                    break;
                }
                buf.truncate(len);
                trace!(%subject, sid, len, "nats: message");
                let msg = BrokerMessage {
                    subject,
                    payload: Bytes::from(buf),
                };
                match tx.try_send(msg) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(m)) => {
                        warn!(subject = %m.subject, "nats: inbound buffer full, message dropped")
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            ServerOp::Ping => {
                if shared.write(b"PONG\r\n").await.is_err() {
                    break;
                }
            }
            ServerOp::Pong => {
                if let Some(waiter) = shared.pongs.lock().pop_front() {
                    let _ = waiter.send(());
                }
            }
            ServerOp::Err(msg) => {
                warn!(error = %msg, "nats: server error");
                if msg.to_ascii_lowercase().contains("authorization") {
                    break;
                }
            }
            ServerOp::Ok | ServerOp::Info(_) => {}
        }
    }
    shared.closed.store(true, Ordering::Release);
    shared.pongs.lock().clear();
}

struct NatsTransport {
    endpoint: Endpoint,
    shared: Arc<Shared>,
    next_sid: AtomicU64,
    max_payload: usize,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Transport for NatsTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        if payload.len() > self.max_payload {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        let mut frame = Vec::with_capacity(subject.len() + payload.len() + 32);
        frame.extend_from_slice(format!("PUB {subject} {}\r\n", payload.len()).as_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(b"\r\n");
        self.shared.write(&frame).await
    }

    async fn subscribe(&self, subject: &str) -> Result<(), TransportError> {
        let sid = {
            let mut sids = self.shared.sids.lock();
            if sids.contains_key(subject) {
                return Ok(());
            }
            let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
            sids.insert(subject.to_string(), sid);
            sid
        };
        self.shared
            .write(format!("SUB {subject} {sid}\r\n").as_bytes())
            .await
    }

    async fn unsubscribe(&self, subject: &str) -> Result<(), TransportError> {
        let sid = self.shared.sids.lock().remove(subject);
        match sid {
            Some(sid) => self.shared.write(format!("UNSUB {sid}\r\n").as_bytes()).await,
            None => Ok(()),
        }
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.shared.pongs.lock().push_back(tx);
        self.shared.write(b"PING\r\n").await?;
        match tokio::time::timeout(PING_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        {
            let mut writer = self.shared.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }
}
