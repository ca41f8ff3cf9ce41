//! [`WeighingSessionEngine`] – one actor task per scale device.
//!
//! The engine owns everything mutable about a session (state, tare offset,
//! sequence number, classifier history) and is the only code that talks to
//! the device's [`HardwareLink`].  Callers reach it through a cloneable
//! [`SessionHandle`].
//!
//! # Lanes
//!
//! | Lane | Carries | Ordering |
//! |---|---|---|
//! | control (unbounded) | `stop`, attach/detach, link lost/recovered, shutdown | always drained first |
//! | commands (bounded) | `start`, `tare`, `read`, liveness probes | FIFO |
//! | sampler | periodic reads while weighing | lowest priority |
//!
//! Exactly one hardware call is in flight at a time because the loop awaits
//! each call before polling a lane again.  A `stop` cannot interrupt a call
//! already dispatched, but it runs before anything still queued and cancels
//! every command submitted before it.
//!
//! # State machine
//!
//! ```text
//! Idle ──start──▶ Weighing ──reading──▶ Stable | Unstable | Overload | Underload
//!  ▲                  │                    (re-evaluated on every reading)
//!  └──────stop────────┴────────────────────────────┘
//! any ──timeout──▶ Disconnected ──recovered──▶ Idle
//! any ──fault────▶ Error (terminal)
//! ```
//!
//! Every accepted transition bumps the sequence number and publishes exactly
//! one [`SessionEvent`] before the command's caller is answered.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, instrument, warn};
use weighbridge_hal::{HardwareLink, LinkCommand};
use weighbridge_kernel::{StabilityClassifier, StabilityConfig};
use weighbridge_middleware::{DeviceChannel, EventBus, SessionReceiver};
use weighbridge_types::{
    Classification, CommandAck, CommandRecord, ScaleError, ScaleReading, SessionEvent,
    SessionEventKind, SessionSnapshot, SessionState, WeighCommand, WeightUnit,
};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tuning shared by every session engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for every call into the hardware link.
    pub command_timeout: Duration,
    /// Period of automatic reads while weighing.
    pub sample_interval: Duration,
    /// Commands that may wait behind the in-flight one.
    pub queue_depth: usize,
    pub stability: StabilityConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            sample_interval: Duration::from_millis(250),
            queue_depth: 32,
            stability: StabilityConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, ScaleError>>;

enum Request {
    Command {
        ticket: u64,
        command: WeighCommand,
        issuer: String,
        reply: Reply<CommandAck>,
    },
    Probe {
        reply: Reply<()>,
    },
}

impl Request {
    fn ticket(&self) -> Option<u64> {
        match self {
            Request::Command { ticket, .. } => Some(*ticket),
            Request::Probe { .. } => None,
        }
    }
}

enum Control {
    Stop {
        ticket: u64,
        issuer: String,
        reply: Reply<CommandAck>,
    },
    Attach(String),
    Detach { issuer: String, mark: u64 },
    LinkLost(String),
    LinkRecovered,
    Shutdown { announce: bool },
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionHandle
// ─────────────────────────────────────────────────────────────────────────────

/// Cheap, cloneable handle to a running engine.
#[derive(Clone)]
pub struct SessionHandle {
    device_id: Arc<str>,
    requests: mpsc::Sender<Request>,
    control: mpsc::UnboundedSender<Control>,
    channel: DeviceChannel,
    tickets: Arc<AtomicU64>,
}

impl SessionHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Queue a command and wait for its outcome.
    ///
    /// `stop` bypasses the queue.  Other commands are rejected with
    /// [`ScaleError::InvalidOperation`] when the queue is full.
    pub async fn submit(
        &self,
        command: WeighCommand,
        issuer: impl Into<String>,
    ) -> Result<CommandAck, ScaleError> {
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let issuer = issuer.into();
        let (reply, rx) = oneshot::channel();

        if command == WeighCommand::Stop {
            self.control
                .send(Control::Stop { ticket, issuer, reply })
                .map_err(|_| self.gone())?;
        } else {
            self.requests
                .try_send(Request::Command {
                    ticket,
                    command,
                    issuer,
                    reply,
                })
                .map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => ScaleError::InvalidOperation(format!(
                        "command queue for {} is full",
                        self.device_id
                    )),
                    mpsc::error::TrySendError::Closed(_) => self.gone(),
                })?;
        }
        rx.await.map_err(|_| self.gone())?
    }

    /// Ask the device whether it is alive.  Runs in the command lane so it
    /// never overlaps another hardware call, and never changes state.
    pub async fn probe(&self) -> Result<(), ScaleError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Probe { reply })
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    pub fn attach(&self, subscriber_id: &str) {
        let _ = self.control.send(Control::Attach(subscriber_id.to_string()));
    }

    /// Mark a subscriber as gone; its commands queued so far are dropped.
    pub fn detach(&self, subscriber_id: &str) {
        let _ = self.control.send(Control::Detach {
            issuer: subscriber_id.to_string(),
            mark: self.tickets.load(Ordering::SeqCst),
        });
    }

    pub fn link_lost(&self, reason: impl Into<String>) {
        let _ = self.control.send(Control::LinkLost(reason.into()));
    }

    pub fn link_recovered(&self) {
        let _ = self.control.send(Control::LinkRecovered);
    }

    /// Stop the engine without telling subscribers.
    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown { announce: false });
    }

    /// Stop the device if it is weighing, publish a final `closed` event, and
    /// end the engine.
    pub fn close(&self) {
        let _ = self.control.send(Control::Shutdown { announce: true });
    }

    /// Resolves once the engine task has exited.
    pub async fn closed(&self) {
        self.requests.closed().await;
    }

    pub fn is_running(&self) -> bool {
        !self.requests.is_closed()
    }

    pub fn subscribe(&self) -> (SessionSnapshot, SessionReceiver) {
        self.channel.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.channel.snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.channel.snapshot().state
    }

    fn gone(&self) -> ScaleError {
        ScaleError::Channel(format!("session for {} has ended", self.device_id))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("device_id", &self.device_id)
            .field("running", &self.is_running())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DetachedIssuers
// ─────────────────────────────────────────────────────────────────────────────

/// Issuers that went away while they still had commands queued, each with the
/// last ticket handed out before it left.  Only entries that can still match a
/// queued command are kept; once the queue drains the set is empty.
#[derive(Debug, Default)]
struct DetachedIssuers {
    marks: HashMap<String, u64>,
}

impl DetachedIssuers {
    fn detach(&mut self, issuer: String, mark: u64, queue_empty: bool) {
        if queue_empty {
            self.marks.clear();
        } else {
            self.marks.insert(issuer, mark);
        }
    }

    fn attach(&mut self, issuer: &str) {
        self.marks.remove(issuer);
    }

    fn is_cancelled(&self, issuer: &str, ticket: u64) -> bool {
        self.marks.get(issuer).is_some_and(|mark| ticket <= *mark)
    }

    /// Forget marks that no queued command can match any more.
    fn processed(&mut self, ticket: Option<u64>, queue_empty: bool) {
        if queue_empty {
            self.marks.clear();
        } else if let Some(ticket) = ticket {
            self.marks.retain(|_, mark| *mark > ticket);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.marks.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// The per-device actor.  Construct it with [`WeighingSessionEngine::spawn`].
pub struct WeighingSessionEngine {
    device_id: String,
    link: Arc<dyn HardwareLink>,
    config: EngineConfig,
    unit: WeightUnit,
    classifier: StabilityClassifier,
    channel: DeviceChannel,
    session: SessionSnapshot,
    detached: DetachedIssuers,
    cancelled_through: u64,
}

impl WeighingSessionEngine {
    /// Probe the device, open its lane on `bus`, and start the actor.
    ///
    /// The session starts `Idle`, or `Disconnected` when the probe fails.
    pub async fn spawn(
        link: Arc<dyn HardwareLink>,
        bus: &EventBus,
        config: EngineConfig,
    ) -> SessionHandle {
        let device_id = link.device_id().to_string();
        let profile = link.profile();

        let initial = match timeout(config.command_timeout, link.probe_liveness()).await {
            Ok(Ok(())) => SessionState::Idle,
            Ok(Err(e)) => {
                warn!(device = %device_id, error = %e, "device unavailable at session start");
                SessionState::Disconnected
            }
            Err(_) => {
                warn!(device = %device_id, "liveness probe timed out at session start");
                SessionState::Disconnected
            }
        };

        let session = SessionSnapshot::new(device_id.clone(), initial);
        let channel = bus.open(session.clone());
        let (requests, request_rx) = mpsc::channel(config.queue_depth.max(1));
        let (control, control_rx) = mpsc::unbounded_channel();

        let engine = Self {
            device_id: device_id.clone(),
            classifier: StabilityClassifier::new(config.stability, profile.rated_capacity),
            unit: profile.unit,
            link,
            config,
            channel: channel.clone(),
            session,
            detached: DetachedIssuers::default(),
            cancelled_through: 0,
        };
        info!(device = %device_id, state = %initial, "session engine started");
        tokio::spawn(engine.run(control_rx, request_rx));

        SessionHandle {
            device_id: Arc::from(device_id.as_str()),
            requests,
            control,
            channel,
            tickets: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut requests: mpsc::Receiver<Request>,
    ) {
        let sampler = tokio::time::sleep(self.config.sample_interval);
        tokio::pin!(sampler);

        loop {
            let was_weighing = self.session.state.is_weighing();
            tokio::select! {
                biased;
                message = control.recv() => match message {
                    Some(Control::Shutdown { announce }) => {
                        if announce {
                            self.announce_close().await;
                        }
                        break;
                    }
                    Some(message) => self.handle_control(message, requests.is_empty()).await,
                    None => break,
                },
                request = requests.recv() => match request {
                    Some(request) => {
                        let ticket = request.ticket();
                        self.handle_request(request).await;
                        self.detached.processed(ticket, requests.is_empty());
                    }
                    None => break,
                },
                () = &mut sampler, if was_weighing => {
                    self.sample().await;
                    sampler.as_mut().reset(Instant::now() + self.config.sample_interval);
                }
            }
            if !was_weighing && self.session.state.is_weighing() {
                sampler.as_mut().reset(Instant::now() + self.config.sample_interval);
            }
        }
        info!(device = %self.device_id, sequence = self.session.sequence, "session engine stopped");
    }

    // -- lanes ---------------------------------------------------------------

    async fn handle_control(&mut self, message: Control, queue_empty: bool) {
        match message {
            Control::Stop { ticket, issuer, reply } => {
                self.cancelled_through = self.cancelled_through.max(ticket);
                let outcome = self.stop(&issuer).await;
                let _ = reply.send(outcome);
            }
            Control::Attach(id) => self.detached.attach(&id),
            Control::Detach { issuer, mark } => self.detached.detach(issuer, mark, queue_empty),
            Control::LinkLost(reason) => self.mark_disconnected(reason),
            Control::LinkRecovered => {
                if self.session.state == SessionState::Disconnected {
                    info!(device = %self.device_id, "device link recovered");
                    self.transition(SessionState::Idle, SessionEventKind::Recovered, None);
                }
            }
            Control::Shutdown { .. } => {}
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Command {
                ticket,
                command,
                issuer,
                reply,
            } => {
                if reply.is_closed() {
                    debug!(device = %self.device_id, %command, %issuer, "caller went away, skipping");
                    return;
                }
                if ticket <= self.cancelled_through {
                    let _ = reply.send(Err(ScaleError::InvalidOperation(format!(
                        "{command} cancelled by stop"
                    ))));
                    return;
                }
                if self.detached.is_cancelled(&issuer, ticket) {
                    debug!(device = %self.device_id, %command, %issuer, "issuer detached, skipping");
                    let _ = reply.send(Err(ScaleError::InvalidOperation(format!(
                        "{command} cancelled, {issuer} disconnected"
                    ))));
                    return;
                }
                let outcome = self.apply(command, &issuer).await;
                let _ = reply.send(outcome);
            }
            Request::Probe { reply } => {
                let link = Arc::clone(&self.link);
                let outcome = match timeout(self.config.command_timeout, link.probe_liveness()).await {
                    Ok(result) => result,
                    Err(_) => Err(ScaleError::timeout(&self.device_id, "probe")),
                };
                let _ = reply.send(outcome);
            }
        }
    }

    async fn sample(&mut self) {
        let link = Arc::clone(&self.link);
        match self.hardware("read", link.read_raw()).await {
            Ok(raw) => {
                self.record_reading(raw);
            }
            Err(e) => debug!(device = %self.device_id, error = %e, "sample failed"),
        }
    }

    // -- commands ------------------------------------------------------------

    fn check_usable(&self) -> Result<(), ScaleError> {
        match self.session.state {
            SessionState::Error => Err(ScaleError::fault(
                &self.device_id,
                self.session.fault.clone().unwrap_or_else(|| "session failed".to_string()),
            )),
            SessionState::Disconnected => Err(ScaleError::InvalidOperation(format!(
                "device {} is disconnected",
                self.device_id
            ))),
            _ => Ok(()),
        }
    }

    #[instrument(level = "debug", skip(self), fields(device = %self.device_id))]
    async fn apply(&mut self, command: WeighCommand, issuer: &str) -> Result<CommandAck, ScaleError> {
        self.check_usable()?;
        let link = Arc::clone(&self.link);
        match command {
            WeighCommand::Start => {
                if self.session.state != SessionState::Idle {
                    return Err(ScaleError::InvalidOperation(format!(
                        "cannot start while {}",
                        self.session.state
                    )));
                }
                self.hardware("start", link.send_command(LinkCommand::Start)).await?;
                self.classifier.reset();
                self.record_command(command, issuer);
                let seq = self.transition(SessionState::Weighing, SessionEventKind::StateChanged, None);
                Ok(self.ack(command, Some(seq), None))
            }
            WeighCommand::Tare => {
                if self.session.state == SessionState::Weighing {
                    return Err(ScaleError::InvalidOperation(
                        "tare needs a settled reading; wait for the first classification".to_string(),
                    ));
                }
                self.hardware("tare", link.send_command(LinkCommand::Tare)).await?;
                let raw = self.hardware("read", link.read_raw()).await?;
                self.session.tare_offset = raw;
                self.record_command(command, issuer);
                let reading = ScaleReading::new(
                    raw,
                    raw,
                    self.unit,
                    self.session
                        .last_reading
                        .as_ref()
                        .map(|r| r.classification)
                        .unwrap_or(Classification::Unstable),
                );
                let seq = self.transition(self.session.state, SessionEventKind::Tared, Some(reading.clone()));
                info!(device = %self.device_id, tare = raw, %issuer, "tare applied");
                Ok(self.ack(command, Some(seq), Some(reading)))
            }
            WeighCommand::Read => {
                let raw = self.hardware("read", link.read_raw()).await?;
                self.record_command(command, issuer);
                let (seq, reading) = self.record_reading(raw);
                Ok(self.ack(command, Some(seq), Some(reading)))
            }
            WeighCommand::Stop => self.stop(issuer).await,
        }
    }

    #[instrument(level = "debug", skip(self), fields(device = %self.device_id))]
    async fn stop(&mut self, issuer: &str) -> Result<CommandAck, ScaleError> {
        self.check_usable()?;
        if self.session.state == SessionState::Idle {
            self.record_command(WeighCommand::Stop, issuer);
            self.channel.update_snapshot(self.session.clone());
            return Ok(self.ack(WeighCommand::Stop, None, None));
        }
        let link = Arc::clone(&self.link);
        self.hardware("stop", link.send_command(LinkCommand::Stop)).await?;
        self.classifier.reset();
        self.record_command(WeighCommand::Stop, issuer);
        let seq = self.transition(SessionState::Idle, SessionEventKind::StateChanged, None);
        Ok(self.ack(WeighCommand::Stop, Some(seq), None))
    }

    async fn announce_close(&mut self) {
        if self.session.state.is_weighing() {
            let link = Arc::clone(&self.link);
            if self.hardware("stop", link.send_command(LinkCommand::Stop)).await.is_ok() {
                self.session.state = SessionState::Idle;
            }
        }
        self.transition(self.session.state, SessionEventKind::Closed, None);
    }

    // -- helpers -------------------------------------------------------------

    /// Run one hardware call under the command deadline and fold failures
    /// into the state machine.
    async fn hardware<T, F>(&mut self, operation: &str, call: F) -> Result<T, ScaleError>
    where
        F: Future<Output = Result<T, ScaleError>>,
    {
        let outcome = match timeout(self.config.command_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ScaleError::timeout(&self.device_id, operation)),
        };
        if let Err(e) = &outcome {
            match e {
                ScaleError::HardwareTimeout { .. } => self.mark_disconnected(e.to_string()),
                ScaleError::HardwareFault { details, .. } => {
                    let details = details.clone();
                    self.mark_failed(details);
                }
                _ => warn!(device = %self.device_id, operation, error = %e, "device rejected call"),
            }
        }
        outcome
    }

    fn mark_disconnected(&mut self, reason: String) {
        if matches!(self.session.state, SessionState::Disconnected | SessionState::Error) {
            return;
        }
        warn!(device = %self.device_id, %reason, "device disconnected");
        self.classifier.reset();
        self.transition(
            SessionState::Disconnected,
            SessionEventKind::Disconnected { reason },
            None,
        );
    }

    fn mark_failed(&mut self, details: String) {
        if self.session.state == SessionState::Error {
            return;
        }
        warn!(device = %self.device_id, %details, "device fault, session failed");
        self.session.fault = Some(details.clone());
        self.transition(SessionState::Error, SessionEventKind::Fault { details }, None);
    }

    fn record_reading(&mut self, raw: f64) -> (u64, ScaleReading) {
        let classification = self.classifier.classify(raw);
        let reading = ScaleReading::new(raw, self.session.tare_offset, self.unit, classification);
        let state = if self.session.state.is_weighing() {
            SessionState::from(classification)
        } else {
            self.session.state
        };
        let seq = self.transition(state, SessionEventKind::Reading, Some(reading.clone()));
        (seq, reading)
    }

    fn record_command(&mut self, command: WeighCommand, issuer: &str) {
        self.session.last_command = Some(CommandRecord {
            command,
            issuer: issuer.to_string(),
            issued_at: Utc::now(),
        });
    }

    fn transition(
        &mut self,
        state: SessionState,
        kind: SessionEventKind,
        reading: Option<ScaleReading>,
    ) -> u64 {
        if state != self.session.state {
            debug!(device = %self.device_id, from = %self.session.state, to = %state, "transition");
        }
        self.session.sequence += 1;
        self.session.state = state;
        if let Some(r) = &reading {
            self.session.last_reading = Some(r.clone());
        }
        let event = SessionEvent {
            device_id: self.device_id.clone(),
            sequence: self.session.sequence,
            state,
            kind,
            reading,
            tare_offset: self.session.tare_offset,
            timestamp: Utc::now(),
        };
        self.channel.publish(event, self.session.clone());
        self.session.sequence
    }

    fn ack(&self, command: WeighCommand, sequence: Option<u64>, reading: Option<ScaleReading>) -> CommandAck {
        CommandAck {
            command,
            state: self.session.state,
            sequence,
            reading,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weighbridge_hal::{SimLink, SimStep};
    use weighbridge_middleware::Delivery;

    fn quiet_config() -> EngineConfig {
        EngineConfig {
            command_timeout: Duration::from_millis(200),
            sample_interval: Duration::from_secs(3600),
            queue_depth: 8,
            stability: StabilityConfig::default(),
        }
    }

    async fn spawn_sim(link: SimLink) -> (Arc<SimLink>, SessionHandle) {
        let link = Arc::new(link);
        let handle =
            WeighingSessionEngine::spawn(link.clone(), &EventBus::default(), quiet_config()).await;
        (link, handle)
    }

    async fn next_event(rx: &mut SessionReceiver) -> SessionEvent {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Delivery::Event(e))) => e,
            other => panic!("expected an event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn starts_idle_when_device_answers() {
        let (_, handle) = spawn_sim(SimLink::new("S1")).await;
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.sequence, 0);
    }

    #[tokio::test]
    async fn starts_disconnected_when_device_is_down() {
        let link = SimLink::new("S1");
        link.set_alive(false);
        let (_, handle) = spawn_sim(link).await;
        assert_eq!(handle.state(), SessionState::Disconnected);

        let err = handle.submit(WeighCommand::Start, "op").await.unwrap_err();
        assert!(matches!(err, ScaleError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn start_publishes_weighing_with_first_sequence() {
        let (link, handle) = spawn_sim(SimLink::new("S1")).await;
        let (_, mut rx) = handle.subscribe();

        let ack = handle.submit(WeighCommand::Start, "op").await.unwrap();
        assert_eq!(ack.state, SessionState::Weighing);
        assert_eq!(ack.sequence, Some(1));

        let event = next_event(&mut rx).await;
        assert_eq!(event.sequence, 1);
        assert_eq!(event.state, SessionState::Weighing);
        assert_eq!(link.commands(), vec![LinkCommand::Start]);

        let last = handle.snapshot().last_command.unwrap();
        assert_eq!(last.command, WeighCommand::Start);
        assert_eq!(last.issuer, "op");
    }

    #[tokio::test]
    async fn readings_settle_into_stable_and_flip_back() {
        let link = SimLink::new("S1").with_capacity(1_000.0);
        link.push_reads([500.0, 500.1, 500.2, 500.1, 650.0].map(SimStep::Value));
        let (_, handle) = spawn_sim(link).await;
        handle.submit(WeighCommand::Start, "op").await.unwrap();

        let mut states = Vec::new();
        for _ in 0..5 {
            states.push(handle.submit(WeighCommand::Read, "op").await.unwrap().state);
        }
        assert_eq!(
            states,
            vec![
                SessionState::Unstable,
                SessionState::Unstable,
                SessionState::Unstable,
                SessionState::Stable,
                SessionState::Unstable,
            ]
        );
        assert_eq!(handle.snapshot().sequence, 6);
    }

    #[tokio::test]
    async fn overload_and_underload_are_states() {
        let link = SimLink::new("S1").with_capacity(1_000.0);
        link.push_reads([SimStep::Value(1_200.0), SimStep::Value(-50.0)]);
        let (_, handle) = spawn_sim(link).await;
        handle.submit(WeighCommand::Start, "op").await.unwrap();

        let ack = handle.submit(WeighCommand::Read, "op").await.unwrap();
        assert_eq!(ack.state, SessionState::Overload);
        assert_eq!(ack.reading.unwrap().classification, Classification::Overload);
        let ack = handle.submit(WeighCommand::Read, "op").await.unwrap();
        assert_eq!(ack.state, SessionState::Underload);
    }

    #[tokio::test]
    async fn read_while_idle_does_not_change_state() {
        let (_, handle) = spawn_sim(SimLink::new("S1").with_load(42.0)).await;
        let ack = handle.submit(WeighCommand::Read, "op").await.unwrap();
        assert_eq!(ack.state, SessionState::Idle);
        assert_eq!(ack.reading.unwrap().raw, 42.0);
        assert_eq!(ack.sequence, Some(1));
    }

    #[tokio::test]
    async fn stop_returns_to_idle() {
        let (link, handle) = spawn_sim(SimLink::new("S1")).await;
        handle.submit(WeighCommand::Start, "op").await.unwrap();
        let ack = handle.submit(WeighCommand::Stop, "op").await.unwrap();
        assert_eq!(ack.state, SessionState::Idle);
        assert_eq!(ack.sequence, Some(2));
        assert_eq!(link.commands(), vec![LinkCommand::Start, LinkCommand::Stop]);
    }

    #[tokio::test]
    async fn stop_from_idle_is_acknowledged_without_event() {
        let (link, handle) = spawn_sim(SimLink::new("S1")).await;
        let ack = handle.submit(WeighCommand::Stop, "op").await.unwrap();
        assert_eq!(ack.state, SessionState::Idle);
        assert_eq!(ack.sequence, None);
        assert!(link.commands().is_empty());
        assert_eq!(handle.snapshot().sequence, 0);
    }

    #[tokio::test]
    async fn start_while_weighing_is_rejected() {
        let (_, handle) = spawn_sim(SimLink::new("S1")).await;
        handle.submit(WeighCommand::Start, "op").await.unwrap();
        let err = handle.submit(WeighCommand::Start, "op").await.unwrap_err();
        assert!(matches!(err, ScaleError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn tare_sets_offset_from_fresh_read() {
        let (link, handle) = spawn_sim(SimLink::new("S1").with_load(120.0)).await;
        let (_, mut rx) = handle.subscribe();

        let ack = handle.submit(WeighCommand::Tare, "op").await.unwrap();
        assert_eq!(ack.state, SessionState::Idle);
        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, SessionEventKind::Tared);
        assert_eq!(event.tare_offset, 120.0);
        assert_eq!(link.commands(), vec![LinkCommand::Tare]);

        link.set_load(170.0);
        let ack = handle.submit(WeighCommand::Read, "op").await.unwrap();
        assert_eq!(ack.reading.unwrap().net, 50.0);
    }

    #[tokio::test]
    async fn tare_mid_start_is_rejected() {
        let (_, handle) = spawn_sim(SimLink::new("S1")).await;
        handle.submit(WeighCommand::Start, "op").await.unwrap();
        let err = handle.submit(WeighCommand::Tare, "op").await.unwrap_err();
        assert!(matches!(err, ScaleError::InvalidOperation(_)));
        assert_eq!(handle.state(), SessionState::Weighing);
    }

    #[tokio::test]
    async fn hung_read_times_out_into_disconnected_and_recovers() {
        let link = SimLink::new("S1");
        link.push_reads([SimStep::Hang]);
        let (_, handle) = spawn_sim(link).await;
        let (_, mut rx) = handle.subscribe();
        handle.submit(WeighCommand::Start, "op").await.unwrap();
        next_event(&mut rx).await;

        let err = handle.submit(WeighCommand::Read, "op").await.unwrap_err();
        assert!(matches!(err, ScaleError::HardwareTimeout { .. }));
        let event = next_event(&mut rx).await;
        assert_eq!(event.state, SessionState::Disconnected);
        assert!(matches!(event.kind, SessionEventKind::Disconnected { .. }));

        handle.link_recovered();
        let event = next_event(&mut rx).await;
        assert_eq!(event.state, SessionState::Idle);
        assert_eq!(event.kind, SessionEventKind::Recovered);
        assert_eq!(event.sequence, 3);
    }

    #[tokio::test]
    async fn fault_is_terminal() {
        let link = SimLink::new("S1");
        link.push_command_outcomes([SimStep::Fault("load cell open".into())]);
        let (_, handle) = spawn_sim(link).await;

        let err = handle.submit(WeighCommand::Start, "op").await.unwrap_err();
        assert!(matches!(err, ScaleError::HardwareFault { .. }));
        assert_eq!(handle.state(), SessionState::Error);
        assert_eq!(handle.snapshot().fault.as_deref(), Some("load cell open"));

        let err = handle.submit(WeighCommand::Read, "op").await.unwrap_err();
        assert!(matches!(err, ScaleError::HardwareFault { .. }));
        handle.link_recovered();
        let err = handle.submit(WeighCommand::Stop, "op").await.unwrap_err();
        assert!(matches!(err, ScaleError::HardwareFault { .. }));
    }

    #[tokio::test]
    async fn queued_commands_run_one_at_a_time_in_order() {
        let link = SimLink::new("S1")
            .with_load(10.0)
            .with_latency(Duration::from_millis(20));
        let (link, handle) = spawn_sim(link).await;

        let (tare, start) = tokio::join!(
            handle.submit(WeighCommand::Tare, "a"),
            handle.submit(WeighCommand::Start, "b"),
        );
        assert_eq!(tare.unwrap().sequence, Some(1));
        assert_eq!(start.unwrap().sequence, Some(2));
        assert_eq!(link.commands(), vec![LinkCommand::Tare, LinkCommand::Start]);
        assert_eq!(link.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn stop_preempts_and_cancels_earlier_queued_commands() {
        let link = SimLink::new("S1").with_latency(Duration::from_millis(50));
        let (link, handle) = spawn_sim(link).await;

        let start = tokio::spawn({
            let h = handle.clone();
            async move { h.submit(WeighCommand::Start, "a").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let read = tokio::spawn({
            let h = handle.clone();
            async move { h.submit(WeighCommand::Read, "a").await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let stop = handle.submit(WeighCommand::Stop, "b").await.unwrap();

        assert_eq!(start.await.unwrap().unwrap().state, SessionState::Weighing);
        assert_eq!(stop.state, SessionState::Idle);
        assert!(matches!(
            read.await.unwrap(),
            Err(ScaleError::InvalidOperation(_))
        ));
        assert_eq!(link.commands(), vec![LinkCommand::Start, LinkCommand::Stop]);
        assert_eq!(link.read_count(), 0);
    }

    #[tokio::test]
    async fn detached_issuer_loses_queued_commands() {
        let link = SimLink::new("S1").with_latency(Duration::from_millis(50));
        let (link, handle) = spawn_sim(link).await;
        handle.attach("b");

        let start = tokio::spawn({
            let h = handle.clone();
            async move { h.submit(WeighCommand::Start, "a").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let read = tokio::spawn({
            let h = handle.clone();
            async move { h.submit(WeighCommand::Read, "b").await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        handle.detach("b");

        assert!(start.await.unwrap().is_ok());
        assert!(read.await.unwrap().is_err());
        assert_eq!(link.read_count(), 0);
    }

    #[test]
    fn detaching_with_an_idle_queue_keeps_nothing() {
        let mut detached = DetachedIssuers::default();
        for i in 0..1000 {
            detached.detach(format!("console-{i}"), i, true);
        }
        assert_eq!(detached.len(), 0);
    }

    #[test]
    fn detached_marks_drain_with_the_queue() {
        let mut detached = DetachedIssuers::default();
        detached.detach("a".into(), 4, false);
        detached.detach("b".into(), 7, false);
        assert!(detached.is_cancelled("a", 3));
        assert!(detached.is_cancelled("a", 4));
        assert!(!detached.is_cancelled("a", 5));
        assert!(!detached.is_cancelled("c", 1));

        detached.processed(Some(5), false);
        assert_eq!(detached.len(), 1);
        assert!(detached.is_cancelled("b", 6));

        detached.processed(None, true);
        assert_eq!(detached.len(), 0);
    }

    #[test]
    fn reattaching_clears_the_mark() {
        let mut detached = DetachedIssuers::default();
        detached.detach("a".into(), 9, false);
        detached.attach("a");
        assert!(!detached.is_cancelled("a", 2));
        assert_eq!(detached.len(), 0);
    }

    #[tokio::test]
    async fn returning_issuer_is_served_after_detach() {
        let (link, handle) = spawn_sim(SimLink::new("S1")).await;
        for _ in 0..50 {
            handle.detach("b");
        }
        let ack = handle.submit(WeighCommand::Read, "b").await.unwrap();
        assert_eq!(ack.state, SessionState::Idle);
        assert_eq!(link.read_count(), 1);
    }

    #[tokio::test]
    async fn sampler_reads_while_weighing() {
        let link = Arc::new(SimLink::new("S1").with_load(300.0));
        let config = EngineConfig {
            sample_interval: Duration::from_millis(10),
            ..quiet_config()
        };
        let handle = WeighingSessionEngine::spawn(link.clone(), &EventBus::default(), config).await;
        let (_, mut rx) = handle.subscribe();
        handle.submit(WeighCommand::Start, "op").await.unwrap();
        next_event(&mut rx).await;

        let mut last = SessionState::Weighing;
        for _ in 0..4 {
            let event = next_event(&mut rx).await;
            assert_eq!(event.kind, SessionEventKind::Reading);
            last = event.state;
        }
        assert_eq!(last, SessionState::Stable);

        handle.submit(WeighCommand::Stop, "op").await.unwrap();
        let reads = link.read_count();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(link.read_count(), reads);
    }

    #[tokio::test]
    async fn close_stops_device_and_announces() {
        let (link, handle) = spawn_sim(SimLink::new("S1")).await;
        let (_, mut rx) = handle.subscribe();
        handle.submit(WeighCommand::Start, "op").await.unwrap();
        next_event(&mut rx).await;

        handle.close();
        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, SessionEventKind::Closed);
        assert_eq!(event.state, SessionState::Idle);
        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .unwrap();
        assert!(!handle.is_running());
        assert_eq!(link.commands(), vec![LinkCommand::Start, LinkCommand::Stop]);
    }

    #[tokio::test]
    async fn probe_failure_does_not_change_state() {
        let (link, handle) = spawn_sim(SimLink::new("S1")).await;
        link.set_alive(false);
        assert!(handle.probe().await.is_err());
        assert_eq!(handle.state(), SessionState::Idle);
        link.set_alive(true);
        assert!(handle.probe().await.is_ok());
    }
}
