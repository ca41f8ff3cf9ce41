//! [`TcpLink`] – line-oriented ASCII driver for networked weight indicators.
//!
//! Most industrial indicators sit behind a serial-to-Ethernet bridge and
//! speak a simple request/reply protocol terminated by `CRLF`:
//!
//! | Request | Reply |
//! |---|---|
//! | `PING` | `OK` |
//! | `READ` | weight frame, e.g. `ST,GS,+00012.34kg` |
//! | `START` / `STOP` / `TARE` | `OK` |
//!
//! Any request may instead be answered with `ERR <message>` (request
//! rejected) or `FAULT <message>` (fatal device condition).
//!
//! The connection is opened lazily and dropped on any I/O error; the next
//! call reconnects.  A request abandoned mid-exchange (its future dropped by
//! a caller deadline) leaves the stream out of step, so the connection is
//! marked busy for the duration of each exchange and a busy connection is
//! discarded instead of reused.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use weighbridge_types::ScaleError;

use crate::link::{DeviceProfile, HardwareLink, LinkCommand};

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

struct Connection {
    stream: BufReader<TcpStream>,
    busy: bool,
}

/// Real-hardware [`HardwareLink`] over TCP.
pub struct TcpLink {
    device_id: String,
    address: String,
    profile: DeviceProfile,
    connect_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl TcpLink {
    /// `address` is a `host:port` pair, e.g. `"10.0.0.20:4001"`.
    pub fn new(device_id: impl Into<String>, address: impl Into<String>, profile: DeviceProfile) -> Self {
        Self {
            device_id: device_id.into(),
            address: address.into(),
            profile,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            conn: Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<Connection, ScaleError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| ScaleError::timeout(&self.device_id, "connect"))?
            .map_err(|e| {
                warn!(device = %self.device_id, address = %self.address, error = %e, "indicator connect failed");
                ScaleError::timeout(&self.device_id, "connect")
            })?;
        stream.set_nodelay(true).ok();
        debug!(device = %self.device_id, address = %self.address, "indicator connected");
        Ok(Connection {
            stream: BufReader::new(stream),
            busy: false,
        })
    }

    /// Send one request line and return the trimmed reply line.
    async fn exchange(&self, request: &str) -> Result<String, ScaleError> {
        let mut guard = self.conn.lock().await;
        if guard.as_ref().is_some_and(|c| c.busy) {
            debug!(device = %self.device_id, "discarding connection left mid-exchange");
            *guard = None;
        }
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        conn.busy = true;
        *guard = Some(conn);
        let result = match guard.as_mut() {
            Some(conn) => round_trip(&mut conn.stream, request).await,
            None => Err(std::io::Error::other("connection vanished")),
        };

        match result {
            Ok(line) => {
                if let Some(conn) = guard.as_mut() {
                    conn.busy = false;
                }
                Ok(line)
            }
            Err(e) => {
                warn!(device = %self.device_id, request, error = %e, "indicator exchange failed");
                *guard = None;
                Err(ScaleError::timeout(&self.device_id, request.to_lowercase()))
            }
        }
    }

    fn interpret(&self, request: &str, reply: &str) -> Result<(), ScaleError> {
        match classify_reply(reply) {
            Reply::Ok => Ok(()),
            Reply::Rejected(msg) => Err(ScaleError::InvalidOperation(format!(
                "{} rejected {request}: {msg}",
                self.device_id
            ))),
            Reply::Fault(msg) => Err(ScaleError::fault(&self.device_id, msg)),
            Reply::Other(other) => Err(ScaleError::Serialization(format!(
                "unexpected reply to {request} from {}: {other}",
                self.device_id
            ))),
        }
    }
}

async fn round_trip(stream: &mut BufReader<TcpStream>, request: &str) -> std::io::Result<String> {
    stream.get_mut().write_all(format!("{request}\r\n").as_bytes()).await?;
    stream.get_mut().flush().await?;
    let mut line = String::new();
    let n = stream.read_line(&mut line).await?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "indicator closed the connection",
        ));
    }
    Ok(line.trim().to_string())
}

#[derive(Debug, PartialEq)]
enum Reply<'a> {
    Ok,
    Rejected(&'a str),
    Fault(&'a str),
    Other(&'a str),
}

fn classify_reply(reply: &str) -> Reply<'_> {
    if reply == "OK" {
        Reply::Ok
    } else if let Some(msg) = reply.strip_prefix("ERR") {
        Reply::Rejected(msg.trim())
    } else if let Some(msg) = reply.strip_prefix("FAULT") {
        Reply::Fault(msg.trim())
    } else {
        Reply::Other(reply)
    }
}

/// Parse a weight frame such as `ST,GS,+00012.34kg` or `US,NT,-1.5 kg`.
///
/// Only the numeric part of the last field is used; the stability header
/// is ignored because classification is done by the session engine.
pub fn parse_weight_frame(frame: &str) -> Option<f64> {
    let field = frame.rsplit(',').next()?.trim();
    let numeric: String = field
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | ' '))
        .filter(|c| *c != ' ')
        .collect();
    numeric.parse::<f64>().ok()
}

#[async_trait]
impl HardwareLink for TcpLink {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn profile(&self) -> DeviceProfile {
        self.profile
    }

    async fn probe_liveness(&self) -> Result<(), ScaleError> {
        let reply = self.exchange("PING").await?;
        self.interpret("PING", &reply)
    }

    async fn read_raw(&self) -> Result<f64, ScaleError> {
        let reply = self.exchange("READ").await?;
        match classify_reply(&reply) {
            Reply::Other(frame) => parse_weight_frame(frame).ok_or_else(|| {
                ScaleError::Serialization(format!(
                    "unparseable weight frame from {}: {frame}",
                    self.device_id
                ))
            }),
            _ => self.interpret("READ", &reply).and(Err(ScaleError::Serialization(format!(
                "{} answered READ without a weight frame",
                self.device_id
            )))),
        }
    }

    async fn send_command(&self, command: LinkCommand) -> Result<(), ScaleError> {
        let reply = self.exchange(command.keyword()).await?;
        self.interpret(command.keyword(), &reply)
    }
}
