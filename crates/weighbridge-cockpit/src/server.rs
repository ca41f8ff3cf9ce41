//! [`CockpitServer`] – HTTP + WebSocket gateway for operator consoles.
//!
//! Listens on `0.0.0.0:8080` (configurable via [`CockpitServer::with_port`]).
//!
//! * Regular HTTP requests → 200 OK with a JSON health document.
//! * WebSocket upgrades → one [`Connection`] per console, bridging the
//!   protocol in [`crate::protocol`] to the [`BroadcastHub`] and
//!   [`StationAdmin`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::Utc;
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;
use weighbridge_middleware::Delivery;
use weighbridge_runtime::{BroadcastHub, StationAdmin};
use weighbridge_types::{ClientIdentity, ScaleError, StationQuery};

use crate::protocol::{ClientOp, ServerFrame, parse_client_frame};

/// Default TCP port for the cockpit HTTP/WebSocket server.
pub const DEFAULT_PORT: u16 = 8080;

/// Frames buffered per console before event forwarding waits on the socket.
const OUTBOUND_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// CockpitServer
// ---------------------------------------------------------------------------

pub struct CockpitServer {
    admin: Arc<StationAdmin>,
    admin_token: Option<Arc<str>>,
    port: u16,
}

impl CockpitServer {
    pub fn new(admin: Arc<StationAdmin>) -> Self {
        Self {
            admin,
            admin_token: None,
            port: DEFAULT_PORT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Token required by `stations.create|update|set_active|delete`.  Without
    /// one those operations are refused.
    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty()).map(Arc::from);
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind `0.0.0.0:<port>` and serve forever.
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::Channel`] if the listener cannot bind.
    pub async fn run(self) -> Result<(), ScaleError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ScaleError::Channel(format!("bind error on {addr}: {e}")))?;
        info!(port = self.port, "cockpit listening on http://localhost:{}", self.port);
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let admin = Arc::clone(&self.admin);
                    let token = self.admin_token.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, admin, token).await {
                            debug!(%peer, error = %e, "client connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    admin: Arc<StationAdmin>,
    admin_token: Option<Arc<str>>,
) -> Result<(), ScaleError> {
    // `peek` leaves the request in place for tungstenite's handshake.
    let mut buf = [0u8; 2048];
    let n = stream
        .peek(&mut buf)
        .await
        .map_err(|e| ScaleError::Channel(format!("peek error from {peer}: {e}")))?;
    let preview = String::from_utf8_lossy(&buf[..n]);

    if is_websocket_upgrade(&preview) {
        let user_agent = header_value(&preview, "user-agent");
        handle_ws(stream, peer, admin, admin_token, user_agent).await
    } else {
        serve_health(stream, &admin).await
    }
}

fn is_websocket_upgrade(request: &str) -> bool {
    header_value(request, "upgrade").is_some_and(|v| v.to_ascii_lowercase().contains("websocket"))
}

fn header_value(request: &str, name: &str) -> Option<String> {
    request.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

/// Compares an admin token without stopping at the first differing byte.
fn tokens_match(expected: &[u8], given: &[u8]) -> bool {
    if expected.len() != given.len() {
        return false;
    }
    let diff = expected
        .iter()
        .zip(given)
        .fold(0u8, |acc, (a, b)| acc | std::hint::black_box(a ^ b));
    diff == 0
}

// ---------------------------------------------------------------------------
// Plain HTTP: health document
// ---------------------------------------------------------------------------

fn health_document(admin: &StationAdmin) -> serde_json::Value {
    json!({
        "status": "ok",
        "service": "weighbridge",
        "timestamp": Utc::now(),
        "stations": admin.registry().len(),
        "devices": admin.hub().device_ids(),
        "sessions": admin.hub().sessions_summary(),
    })
}

async fn serve_health(mut stream: TcpStream, admin: &StationAdmin) -> Result<(), ScaleError> {
    let body = health_document(admin).to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| ScaleError::Channel(format!("HTTP write error: {e}")))
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

async fn handle_ws(
    stream: TcpStream,
    peer: SocketAddr,
    admin: Arc<StationAdmin>,
    admin_token: Option<Arc<str>>,
    user_agent: Option<String>,
) -> Result<(), ScaleError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| ScaleError::Channel(format!("WS handshake from {peer}: {e}")))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (outbound, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

    let mut conn = Connection::new(admin, admin_token, Some(peer.ip()), user_agent, outbound);
    info!(client = %conn.client_id, %peer, "console connected");

    loop {
        tokio::select! {
            // ── Downstream: events and deferred replies → console ─────────
            Some(frame) = outbound_rx.recv() => {
                if send_frame(&mut ws_tx, &frame).await.is_err() {
                    break;
                }
            }
            // ── Upstream: console → core ──────────────────────────────────
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    conn.reap_commands();
                    if let Some(reply) = conn.handle_text(text.as_str()).await
                        && send_frame(&mut ws_tx, &reply).await.is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                _ => {}
            },
        }
    }

    info!(client = %conn.client_id, %peer, "console disconnected");
    conn.close().await;
    Ok(())
}

async fn send_frame<S>(sink: &mut S, frame: &ServerFrame) -> Result<(), ScaleError>
where
    S: Sink<Message> + Unpin,
{
    let json = frame.to_json()?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|_| ScaleError::Channel("console socket closed".to_string()))
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Everything one console owns: its subscriptions' forwarders and its
/// in-flight commands.  Dropping a connection without [`Connection::close`]
/// still aborts both, but only `close` detaches it from the hub.
pub(crate) struct Connection {
    client_id: String,
    peer_ip: Option<IpAddr>,
    user_agent: Option<String>,
    admin: Arc<StationAdmin>,
    admin_token: Option<Arc<str>>,
    outbound: mpsc::Sender<ServerFrame>,
    forwarders: HashMap<String, JoinHandle<()>>,
    commands: JoinSet<()>,
}

impl Connection {
    pub(crate) fn new(
        admin: Arc<StationAdmin>,
        admin_token: Option<Arc<str>>,
        peer_ip: Option<IpAddr>,
        user_agent: Option<String>,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> Self {
        Self {
            client_id: format!("console-{}", Uuid::new_v4()),
            peer_ip,
            user_agent,
            admin,
            admin_token,
            outbound,
            forwarders: HashMap::new(),
            commands: JoinSet::new(),
        }
    }

    fn hub(&self) -> &Arc<BroadcastHub> {
        self.admin.hub()
    }

    fn identity(&self, hostname: &str, claimed_ip: Option<&str>) -> ClientIdentity {
        ClientIdentity::observe(hostname, claimed_ip, self.peer_ip, self.user_agent.clone())
    }

    /// Handle one text frame.  Returns the immediate reply, or `None` when
    /// the reply will arrive later on the outbound channel.
    pub(crate) async fn handle_text(&mut self, text: &str) -> Option<ServerFrame> {
        let frame = match parse_client_frame(text) {
            Ok(frame) => frame,
            Err(error_frame) => return Some(error_frame),
        };
        let request_id = frame.request_id;
        let op = frame.op;
        let name = op.name();

        if let Some(token) = op.admin_token()
            && let Err(e) = self.check_admin(token)
        {
            warn!(client = %self.client_id, op = name, "admin operation refused");
            return Some(ServerFrame::error(request_id, &e));
        }

        let outcome = match op {
            ClientOp::AccessCheck {
                hostname,
                ip,
                user_agent,
            } => {
                let mut identity = self.identity(&hostname, ip.as_deref());
                if user_agent.is_some() {
                    identity.user_agent = user_agent;
                }
                Ok(ServerFrame::reply(
                    request_id.clone(),
                    name,
                    self.admin.check_access(&identity),
                ))
            }
            ClientOp::Subscribe {
                device_id,
                hostname,
                ip,
            } => self
                .subscribe(&device_id, &hostname, ip.as_deref())
                .await
                .map(|snapshot| ServerFrame::reply(request_id.clone(), name, snapshot)),
            ClientOp::Unsubscribe { device_id } => {
                let removed = self.unsubscribe(&device_id).await;
                Ok(ServerFrame::reply(
                    request_id.clone(),
                    name,
                    json!({ "unsubscribed": removed }),
                ))
            }
            ClientOp::Command { device_id, command } => {
                let hub = Arc::clone(self.hub());
                let client = self.client_id.clone();
                let outbound = self.outbound.clone();
                self.commands.spawn(async move {
                    let frame = match hub.submit(&device_id, &client, command).await {
                        Ok(ack) => ServerFrame::reply(request_id, name, ack),
                        Err(e) => ServerFrame::error(request_id, &e),
                    };
                    let _ = outbound.send(frame).await;
                });
                return None;
            }
            ClientOp::Snapshot { device_id } if !self.forwarders.contains_key(&device_id) => {
                Err(ScaleError::InvalidOperation(format!(
                    "{} is not subscribed to {device_id}",
                    self.client_id
                )))
            }
            ClientOp::Snapshot { device_id } => self
                .hub()
                .snapshot(&device_id)
                .ok_or_else(|| ScaleError::NotFound(format!("no session for device {device_id}")))
                .map(|snapshot| ServerFrame::reply(request_id.clone(), name, snapshot)),
            ClientOp::StationsList {
                search,
                page,
                limit,
            } => Ok(ServerFrame::reply(
                request_id.clone(),
                name,
                self.admin.list(&StationQuery { search, page, limit }),
            )),
            ClientOp::StationsGet { id } => self
                .admin
                .get(&id)
                .map(|s| ServerFrame::reply(request_id.clone(), name, s)),
            ClientOp::StationsCreate { station, .. } => self
                .admin
                .create(station)
                .map(|s| ServerFrame::reply(request_id.clone(), name, s)),
            ClientOp::StationsUpdate { id, patch, .. } => self
                .admin
                .update(&id, patch)
                .map(|s| ServerFrame::reply(request_id.clone(), name, s)),
            ClientOp::StationsSetActive { id, active, .. } => self
                .admin
                .set_active(&id, active)
                .map(|s| ServerFrame::reply(request_id.clone(), name, s)),
            ClientOp::StationsDelete { id, force, .. } => self
                .admin
                .delete(&id, force)
                .await
                .map(|s| ServerFrame::reply(request_id.clone(), name, s)),
        };

        Some(outcome.unwrap_or_else(|e| ServerFrame::error(request_id, &e)))
    }

    /// Drop the results of command tasks that already replied.
    fn reap_commands(&mut self) {
        while let Some(joined) = self.commands.try_join_next() {
            if let Err(e) = joined {
                debug!(client = %self.client_id, error = %e, "command task ended abnormally");
            }
        }
    }

    fn check_admin(&self, token: Option<&str>) -> Result<(), ScaleError> {
        let denied = || ScaleError::AccessDenied {
            hostname: self.client_id.clone(),
            ip: self
                .peer_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        };
        match (&self.admin_token, token) {
            (Some(expected), Some(given)) if tokens_match(expected.as_bytes(), given.as_bytes()) => {
                Ok(())
            }
            _ => Err(denied()),
        }
    }

    async fn subscribe(
        &mut self,
        device_id: &str,
        hostname: &str,
        claimed_ip: Option<&str>,
    ) -> Result<weighbridge_types::SessionSnapshot, ScaleError> {
        let identity = self.identity(hostname, claimed_ip);
        self.admin.authorize(&identity, device_id)?;

        let subscription = self.hub().subscribe(device_id, &self.client_id).await?;
        let mut receiver = subscription.receiver;
        let outbound = self.outbound.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                let frame = match delivery {
                    Delivery::Event(event) => ServerFrame::Event { event },
                    Delivery::Resync(snapshot) => ServerFrame::Resync { snapshot },
                };
                if outbound.send(frame).await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.forwarders.insert(device_id.to_string(), forwarder) {
            previous.abort();
        }
        info!(client = %self.client_id, device = %device_id, host = %identity.hostname, "console subscribed");
        Ok(subscription.snapshot)
    }

    async fn unsubscribe(&mut self, device_id: &str) -> bool {
        if let Some(forwarder) = self.forwarders.remove(device_id) {
            forwarder.abort();
        }
        self.hub().unsubscribe(device_id, &self.client_id).await
    }

    /// Detach from every device and drop queued commands.
    pub(crate) async fn close(mut self) {
        self.commands.abort_all();
        let devices: Vec<String> = self.forwarders.keys().cloned().collect();
        for device in devices {
            self.unsubscribe(&device).await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
