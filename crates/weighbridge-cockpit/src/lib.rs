//! `weighbridge-cockpit` – Operator Console Gateway
//!
//! A small HTTP + WebSocket server (default port `8080`) through which
//! operator consoles reach the weighing core:
//!
//! 1. **Plain HTTP** requests get a JSON health document listing live
//!    sessions.
//!
//! 2. **WebSocket** connections speak a JSON protocol (see [`protocol`]):
//!    access checks, subscribe / unsubscribe to a device, `start` / `stop` /
//!    `tare` / `read` commands, snapshots, and station administration.
//!    Session events are pushed to each subscribed console as they happen.
//!
//! The TCP peer address is taken as the client's trusted IP; anything the
//! client claims about its own address is only a fallback.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weighbridge_cockpit::CockpitServer;
//! # async fn boot(admin: Arc<weighbridge_runtime::StationAdmin>) {
//! CockpitServer::new(admin)
//!     .with_port(8080)
//!     .run()
//!     .await
//!     .expect("cockpit server failed");
//! # }
//! ```

pub mod protocol;
pub mod server;

pub use protocol::{ClientFrame, ClientOp, ServerFrame};
pub use server::{CockpitServer, DEFAULT_PORT};
