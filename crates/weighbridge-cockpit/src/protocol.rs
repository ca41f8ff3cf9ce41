//! JSON frames exchanged with operator consoles.
//!
//! Every client frame names an `op` and may carry a `request_id`, which is
//! echoed in the matching `reply` or `error` frame:
//!
//! ```json
//! {"op": "subscribe", "request_id": 7, "device_id": "S1", "hostname": "WB-GATE-A"}
//! {"op": "command", "request_id": 8, "device_id": "S1", "command": "start"}
//! ```
//!
//! | `op` | Fields | Reply `data` |
//! |---|---|---|
//! | `access_check` | `hostname`, `ip?`, `user_agent?` | access decision |
//! | `subscribe` | `device_id`, `hostname`, `ip?` | session snapshot |
//! | `unsubscribe` | `device_id` | `{"unsubscribed": bool}` |
//! | `command` | `device_id`, `command` | command ack |
//! | `snapshot` | `device_id` | session snapshot (subscribed consoles only) |
//! | `stations.list` | `search?`, `page?`, `limit?` | station page |
//! | `stations.get` | `id` | station |
//! | `stations.create` | `token`, `station` | station |
//! | `stations.update` | `token`, `id`, `patch` | station |
//! | `stations.set_active` | `token`, `id`, `active` | station |
//! | `stations.delete` | `token`, `id`, `force?` | deleted station |
//!
//! Server frames are tagged by `type`: `reply`, `event` (a session event),
//! `resync` (a snapshot replacing local state after a gap), and `error`
//! (`code` is [`ScaleError::code`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use weighbridge_types::{
    NewStation, ScaleError, SessionEvent, SessionSnapshot, StationPatch, WeighCommand,
};

/// One inbound frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub request_id: Option<Value>,
    #[serde(flatten)]
    pub op: ClientOp,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op")]
pub enum ClientOp {
    #[serde(rename = "access_check")]
    AccessCheck {
        hostname: String,
        #[serde(default)]
        ip: Option<String>,
        #[serde(default)]
        user_agent: Option<String>,
    },
    #[serde(rename = "subscribe")]
    Subscribe {
        device_id: String,
        hostname: String,
        #[serde(default)]
        ip: Option<String>,
    },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { device_id: String },
    #[serde(rename = "command")]
    Command {
        device_id: String,
        command: WeighCommand,
    },
    #[serde(rename = "snapshot")]
    Snapshot { device_id: String },
    #[serde(rename = "stations.list")]
    StationsList {
        #[serde(default)]
        search: Option<String>,
        #[serde(default)]
        page: Option<usize>,
        #[serde(default)]
        limit: Option<usize>,
    },
    #[serde(rename = "stations.get")]
    StationsGet { id: String },
    #[serde(rename = "stations.create")]
    StationsCreate {
        #[serde(default)]
        token: Option<String>,
        station: NewStation,
    },
    #[serde(rename = "stations.update")]
    StationsUpdate {
        #[serde(default)]
        token: Option<String>,
        id: String,
        patch: StationPatch,
    },
    #[serde(rename = "stations.set_active")]
    StationsSetActive {
        #[serde(default)]
        token: Option<String>,
        id: String,
        active: bool,
    },
    #[serde(rename = "stations.delete")]
    StationsDelete {
        #[serde(default)]
        token: Option<String>,
        id: String,
        #[serde(default)]
        force: bool,
    },
}

impl ClientOp {
    /// Wire name of the operation, echoed in replies.
    pub fn name(&self) -> &'static str {
        match self {
            ClientOp::AccessCheck { .. } => "access_check",
            ClientOp::Subscribe { .. } => "subscribe",
            ClientOp::Unsubscribe { .. } => "unsubscribe",
            ClientOp::Command { .. } => "command",
            ClientOp::Snapshot { .. } => "snapshot",
            ClientOp::StationsList { .. } => "stations.list",
            ClientOp::StationsGet { .. } => "stations.get",
            ClientOp::StationsCreate { .. } => "stations.create",
            ClientOp::StationsUpdate { .. } => "stations.update",
            ClientOp::StationsSetActive { .. } => "stations.set_active",
            ClientOp::StationsDelete { .. } => "stations.delete",
        }
    }

    /// Admin token carried by registration writes.
    pub fn admin_token(&self) -> Option<Option<&str>> {
        match self {
            ClientOp::StationsCreate { token, .. }
            | ClientOp::StationsUpdate { token, .. }
            | ClientOp::StationsSetActive { token, .. }
            | ClientOp::StationsDelete { token, .. } => Some(token.as_deref()),
            _ => None,
        }
    }
}

/// One outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        op: &'static str,
        data: Value,
    },
    Event {
        event: SessionEvent,
    },
    Resync {
        snapshot: SessionSnapshot,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        code: &'static str,
        message: String,
    },
}

impl ServerFrame {
    pub fn reply(request_id: Option<Value>, op: &'static str, data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => ServerFrame::Reply { request_id, op, data },
            Err(e) => ServerFrame::error(request_id, &ScaleError::Serialization(e.to_string())),
        }
    }

    pub fn error(request_id: Option<Value>, error: &ScaleError) -> Self {
        ServerFrame::Error {
            request_id,
            code: error.code(),
            message: error.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, ScaleError> {
        serde_json::to_string(self).map_err(|e| ScaleError::Serialization(e.to_string()))
    }
}

/// Decode a text frame.  Malformed input is reported with whatever
/// `request_id` could still be recovered.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, ServerFrame> {
    serde_json::from_str::<ClientFrame>(text).map_err(|e| {
        let request_id = serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|v| v.get("request_id").cloned());
        ServerFrame::error(request_id, &ScaleError::Serialization(e.to_string()))
    })
}
