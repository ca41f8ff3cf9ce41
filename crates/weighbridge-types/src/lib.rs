use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Stations and access
// ─────────────────────────────────────────────────────────────────────────────

/// A physical scale installation and the machines allowed to operate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleStation {
    /// Immutable once created; doubles as the scale device id.
    pub id: String,
    pub name: String,
    pub location: String,
    /// Matched exactly or as a substring of the client hostname.
    pub allowed_hostnames: Vec<String>,
    /// Matched as exact IP literals.
    pub allowed_ips: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration payload for a new [`ScaleStation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewStation {
    /// Caller-chosen id.  A UUID v4 is assigned when absent.
    pub id: Option<String>,
    pub name: String,
    pub location: String,
    pub allowed_hostnames: Vec<String>,
    pub allowed_ips: Vec<String>,
    pub is_active: bool,
}

impl Default for NewStation {
    fn default() -> Self {
        Self::new("")
    }
}

impl NewStation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            location: String::new(),
            allowed_hostnames: Vec::new(),
            allowed_ips: Vec::new(),
            is_active: true,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn allow_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.allowed_hostnames.push(hostname.into());
        self
    }

    pub fn allow_ip(mut self, ip: impl Into<String>) -> Self {
        self.allowed_ips.push(ip.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Materialise the station, stamping both timestamps with `now`.
    pub fn into_station(self, now: DateTime<Utc>) -> ScaleStation {
        ScaleStation {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            location: self.location,
            allowed_hostnames: self.allowed_hostnames,
            allowed_ips: self.allowed_ips,
            is_active: self.is_active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update for a [`ScaleStation`].  `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StationPatch {
    pub name: Option<String>,
    pub location: Option<String>,
    pub allowed_hostnames: Option<Vec<String>>,
    pub allowed_ips: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

impl StationPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.location.is_none()
            && self.allowed_hostnames.is_none()
            && self.allowed_ips.is_none()
            && self.is_active.is_none()
    }
}

/// Listing filter.  Without `page` and `limit` the full set is returned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StationQuery {
    pub search: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

impl StationQuery {
    pub fn is_paginated(&self) -> bool {
        self.page.is_some() || self.limit.is_some()
    }
}

/// One page (or the whole set) of stations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationPage {
    pub stations: Vec<ScaleStation>,
    /// Number of stations matching the search, before pagination.
    pub total: usize,
    pub page: Option<usize>,
    pub limit: Option<usize>,
    pub total_pages: Option<usize>,
}

/// Runtime-observed identity of a machine asking for access.  Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    /// Client supplied, untrusted.
    pub hostname: String,
    pub ip: Option<String>,
    /// Informational only.
    pub user_agent: Option<String>,
}

impl ClientIdentity {
    /// Build an identity from what the client claims and what the transport
    /// observed.  The transport address wins over the claimed one.
    pub fn observe(
        hostname: impl Into<String>,
        claimed_ip: Option<&str>,
        transport_ip: Option<IpAddr>,
        user_agent: Option<String>,
    ) -> Self {
        let ip = transport_ip
            .map(|addr| normalize_ip(&addr.to_string()))
            .or_else(|| claimed_ip.filter(|s| !s.trim().is_empty()).map(normalize_ip));
        Self {
            hostname: hostname.into().trim().to_string(),
            ip,
            user_agent,
        }
    }
}

/// Canonicalise an IP literal.  IPv4-mapped IPv6 addresses collapse to
/// dotted IPv4; strings that are not IP literals are only trimmed.
pub fn normalize_ip(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(IpAddr::V4(v4)) => v4.to_string(),
        Err(_) => trimmed.to_string(),
    }
}

/// Result of matching a [`ClientIdentity`] against the registered stations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub has_access: bool,
    pub station: Option<ScaleStation>,
    /// Every IP currently allowed by an active station, for diagnostics.
    pub allowed_ips: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Readings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    #[default]
    Kg,
    Lb,
    Tonne,
}

impl fmt::Display for WeightUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightUnit::Kg => write!(f, "kg"),
            WeightUnit::Lb => write!(f, "lb"),
            WeightUnit::Tonne => write!(f, "t"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Stable,
    Unstable,
    Overload,
    Underload,
}

/// One sample, produced only by the session engine of its device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleReading {
    pub raw: f64,
    /// `raw - tare_offset`, never below zero.
    pub net: f64,
    pub unit: WeightUnit,
    pub classification: Classification,
    pub timestamp: DateTime<Utc>,
}

impl ScaleReading {
    pub fn new(raw: f64, tare_offset: f64, unit: WeightUnit, classification: Classification) -> Self {
        Self {
            raw,
            net: net_weight(raw, tare_offset),
            unit,
            classification,
            timestamp: Utc::now(),
        }
    }
}

/// Net weight clamped at zero from below.
pub fn net_weight(raw: f64, tare_offset: f64) -> f64 {
    (raw - tare_offset).max(0.0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a per-device weighing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    /// Started, waiting for the first classified reading.
    Weighing,
    Stable,
    Unstable,
    Overload,
    Underload,
    Disconnected,
    /// Terminal for the session instance.
    Error,
}

impl SessionState {
    /// `true` while the device is being sampled.
    pub fn is_weighing(self) -> bool {
        matches!(
            self,
            SessionState::Weighing
                | SessionState::Stable
                | SessionState::Unstable
                | SessionState::Overload
                | SessionState::Underload
        )
    }

    /// `true` when a session in this state may be torn down without
    /// interrupting a weighing.
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Disconnected | SessionState::Error
        )
    }
}

impl From<Classification> for SessionState {
    fn from(c: Classification) -> Self {
        match c {
            Classification::Stable => SessionState::Stable,
            Classification::Unstable => SessionState::Unstable,
            Classification::Overload => SessionState::Overload,
            Classification::Underload => SessionState::Underload,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Weighing => "weighing",
            SessionState::Stable => "stable",
            SessionState::Unstable => "unstable",
            SessionState::Overload => "overload",
            SessionState::Underload => "underload",
            SessionState::Disconnected => "disconnected",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Operator commands accepted by a session engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeighCommand {
    Start,
    Stop,
    Tare,
    Read,
}

impl fmt::Display for WeighCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WeighCommand::Start => "start",
            WeighCommand::Stop => "stop",
            WeighCommand::Tare => "tare",
            WeighCommand::Read => "read",
        };
        f.write_str(s)
    }
}

/// The last command a session applied and who issued it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: WeighCommand,
    pub issuer: String,
    pub issued_at: DateTime<Utc>,
}

/// Outcome of an applied command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub command: WeighCommand,
    pub state: SessionState,
    /// Sequence of the event the command published, if it published one.
    pub sequence: Option<u64>,
    pub reading: Option<ScaleReading>,
}

/// What a [`SessionEvent`] announces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    StateChanged,
    Reading,
    Tared,
    Disconnected { reason: String },
    Recovered,
    Fault { details: String },
    /// The session was torn down; no further events follow.
    Closed,
}

/// One published session transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub device_id: String,
    /// Strictly increasing by one per device.
    pub sequence: u64,
    pub state: SessionState,
    pub kind: SessionEventKind,
    pub reading: Option<ScaleReading>,
    pub tare_offset: f64,
    pub timestamp: DateTime<Utc>,
}

/// Full session state used to (re)synchronise a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub device_id: String,
    pub state: SessionState,
    /// Sequence of the last event folded into this snapshot.
    pub sequence: u64,
    pub last_reading: Option<ScaleReading>,
    pub tare_offset: f64,
    pub last_command: Option<CommandRecord>,
    /// Set once the session has entered [`SessionState::Error`].
    pub fault: Option<String>,
}

impl SessionSnapshot {
    pub fn new(device_id: impl Into<String>, state: SessionState) -> Self {
        Self {
            device_id: device_id.into(),
            state,
            sequence: 0,
            last_reading: None,
            tare_offset: 0.0,
            last_command: None,
            fault: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error type shared by every weighbridge crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScaleError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Access denied for host '{hostname}' ({ip})")]
    AccessDenied { hostname: String, ip: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Hardware timeout on {device} during {operation}")]
    HardwareTimeout { device: String, operation: String },

    #[error("Hardware fault on {device}: {details}")]
    HardwareFault { device: String, details: String },

    #[error("Station {0} has an active weighing session")]
    HasActiveSession(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ScaleError {
    /// Stable machine-readable code for wire replies.
    pub fn code(&self) -> &'static str {
        match self {
            ScaleError::NotFound(_) => "NOT_FOUND",
            ScaleError::DuplicateId(_) => "DUPLICATE_ID",
            ScaleError::AccessDenied { .. } => "ACCESS_DENIED",
            ScaleError::InvalidOperation(_) => "INVALID_OPERATION",
            ScaleError::HardwareTimeout { .. } => "HARDWARE_TIMEOUT",
            ScaleError::HardwareFault { .. } => "HARDWARE_FAULT",
            ScaleError::HasActiveSession(_) => "HAS_ACTIVE_SESSION",
            ScaleError::Channel(_) => "CHANNEL",
            ScaleError::Serialization(_) => "SERIALIZATION",
            ScaleError::Storage(_) => "STORAGE",
        }
    }

    pub fn timeout(device: impl Into<String>, operation: impl Into<String>) -> Self {
        ScaleError::HardwareTimeout {
            device: device.into(),
            operation: operation.into(),
        }
    }

    pub fn fault(device: impl Into<String>, details: impl Into<String>) -> Self {
        ScaleError::HardwareFault {
            device: device.into(),
            details: details.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn net_weight_never_negative() {
        assert_eq!(net_weight(3.0, 10.0), 0.0);
        assert!((net_weight(12.5, 2.5) - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reading_applies_tare() {
        let reading = ScaleReading::new(3.0, 10.0, WeightUnit::Kg, Classification::Stable);
        assert_eq!(reading.raw, 3.0);
        assert_eq!(reading.net, 0.0);
    }

    #[test]
    fn transport_ip_wins_over_claimed_ip() {
        let transport = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        let id = ClientIdentity::observe(" pc-01 ", Some("10.0.0.5"), Some(transport), None);
        assert_eq!(id.hostname, "pc-01");
        assert_eq!(id.ip.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn claimed_ip_used_without_transport() {
        let id = ClientIdentity::observe("pc-01", Some("10.0.0.5"), None, None);
        assert_eq!(id.ip.as_deref(), Some("10.0.0.5"));

        let blank = ClientIdentity::observe("pc-01", Some("  "), None, None);
        assert!(blank.ip.is_none());
    }

    #[test]
    fn ipv4_mapped_ipv6_is_normalised() {
        let mapped = IpAddr::V6(Ipv4Addr::new(192, 168, 1, 20).to_ipv6_mapped());
        let id = ClientIdentity::observe("x", None, Some(mapped), None);
        assert_eq!(id.ip.as_deref(), Some("192.168.1.20"));

        assert_eq!(normalize_ip("::ffff:10.0.0.5"), "10.0.0.5");
        assert_eq!(normalize_ip(&Ipv6Addr::LOCALHOST.to_string()), "::1");
        assert_eq!(normalize_ip(" not-an-ip "), "not-an-ip");
    }

    #[test]
    fn new_station_assigns_uuid_when_id_missing() {
        let now = Utc::now();
        let station = NewStation::new("Gate A").into_station(now);
        assert!(Uuid::parse_str(&station.id).is_ok());
        assert_eq!(station.created_at, station.updated_at);

        let named = NewStation::new("Gate B").with_id("S1").into_station(now);
        assert_eq!(named.id, "S1");
    }

    #[test]
    fn new_station_deserialises_active_by_default() {
        let station: NewStation = serde_json::from_str(r#"{"name":"Gate A"}"#).unwrap();
        assert!(station.is_active);
        assert!(station.id.is_none());
    }

    #[test]
    fn state_helpers() {
        assert!(SessionState::Stable.is_weighing());
        assert!(SessionState::Weighing.is_weighing());
        assert!(!SessionState::Idle.is_weighing());
        assert!(SessionState::Error.is_idle());
        assert!(!SessionState::Overload.is_idle());
        assert_eq!(SessionState::from(Classification::Overload), SessionState::Overload);
    }

    #[test]
    fn event_kind_serialises_with_type_tag() {
        let kind = SessionEventKind::Disconnected {
            reason: "probe timeout".to_string(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "disconnected");
        assert_eq!(json["reason"], "probe timeout");
    }

    #[test]
    fn error_codes_and_display() {
        let err = ScaleError::fault("S1", "load cell open circuit");
        assert_eq!(err.code(), "HARDWARE_FAULT");
        assert!(err.to_string().contains("S1"));

        let err = ScaleError::AccessDenied {
            hostname: "pc-9".to_string(),
            ip: "10.1.1.1".to_string(),
        };
        assert_eq!(err.code(), "ACCESS_DENIED");
        assert!(err.to_string().contains("pc-9"));
    }

    #[test]
    fn station_serialises_camel_case() {
        let station = NewStation::new("Gate A")
            .with_id("S1")
            .allow_ip("10.0.0.5")
            .into_station(Utc::now());
        let json = serde_json::to_value(&station).unwrap();
        assert_eq!(json["allowedIps"][0], "10.0.0.5");
        assert_eq!(json["isActive"], true);
    }
}
