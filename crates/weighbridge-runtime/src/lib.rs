//! `weighbridge-runtime` – Session Orchestration
//!
//! Turns the pure rules in `weighbridge-kernel` and the device drivers in
//! `weighbridge-hal` into running, concurrent weighing sessions.
//!
//! # Modules
//!
//! - [`engine`] – [`WeighingSessionEngine`][engine::WeighingSessionEngine]:
//!   one actor task per device owning its state machine, command queue, and
//!   stability classifier.  Reached through a cloneable
//!   [`SessionHandle`][engine::SessionHandle].
//! - [`hub`] – [`BroadcastHub`][hub::BroadcastHub]: per-device subscriber
//!   sets, lazy session creation, and teardown once a device is idle and
//!   unobserved.
//! - [`health`] – [`ConnectionHealthMonitor`][health::ConnectionHealthMonitor]:
//!   periodic liveness probes that force a session into `Disconnected` after
//!   repeated failures and restore it afterwards.
//! - [`admin`] – [`StationAdmin`][admin::StationAdmin]: station CRUD with
//!   access checks and write-through persistence.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable trace export.

pub mod admin;
pub mod engine;
pub mod health;
pub mod hub;
pub mod telemetry;

pub use admin::StationAdmin;
pub use engine::{EngineConfig, SessionHandle, WeighingSessionEngine};
pub use health::{ConnectionHealthMonitor, MonitorConfig};
pub use hub::{BroadcastHub, SessionSummary, Subscription};
pub use telemetry::{TracerProviderGuard, init_tracing};
