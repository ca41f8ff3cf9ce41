//! `weighbridge-store` – Station Persistence
//!
//! Keeps the scale station registry on disk so access lists survive a
//! restart.  The in-memory `ScaleRegistry` stays the source of truth at
//! runtime; this crate is written through on every administrative change and
//! read once at startup.
//!
//! # Modules
//!
//! - [`stations`] – [`StationStore`][stations::StationStore]: SQLite table of
//!   stations that remembers registration order.

pub mod stations;

pub use stations::{StationStore, StoreError};
