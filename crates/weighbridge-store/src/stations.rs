//! SQLite-backed station table.
//!
//! # Storage layout
//!
//! A single table `scale_stations`:
//!
//! | column            | type    | description                                   |
//! |-------------------|---------|-----------------------------------------------|
//! | id                | TEXT    | primary key, immutable                        |
//! | position          | INTEGER | registration order, assigned on first insert  |
//! | name              | TEXT    | display name                                  |
//! | location          | TEXT    | location label                                |
//! | allowed_hostnames | TEXT    | JSON array of strings                         |
//! | allowed_ips       | TEXT    | JSON array of IP literals                     |
//! | is_active         | INTEGER | `0` or `1`                                    |
//! | created_at        | TEXT    | RFC-3339 timestamp (UTC)                      |
//! | updated_at        | TEXT    | RFC-3339 timestamp (UTC)                      |
//!
//! Access evaluation depends on registration order, so [`StationStore::load_all`]
//! returns rows ordered by `position` and an update never moves a row.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use weighbridge_store::StationStore;
//! use weighbridge_types::NewStation;
//!
//! let store = StationStore::open_in_memory().unwrap();
//! let station = NewStation::new("Gate A").with_id("S1").into_station(Utc::now());
//! store.upsert(&station).unwrap();
//!
//! assert_eq!(store.load_all().unwrap().len(), 1);
//! ```

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;
use tracing::debug;
use weighbridge_types::{ScaleError, ScaleStation};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl From<StoreError> for ScaleError {
    fn from(e: StoreError) -> Self {
        ScaleError::Storage(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StationStore
// ─────────────────────────────────────────────────────────────────────────────

/// Durable copy of the station registry.
pub struct StationStore {
    conn: Mutex<Connection>,
}

impl StationStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "station store opened");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scale_stations (
                id                TEXT NOT NULL PRIMARY KEY,
                position          INTEGER NOT NULL,
                name              TEXT NOT NULL,
                location          TEXT NOT NULL DEFAULT '',
                allowed_hostnames TEXT NOT NULL DEFAULT '[]',
                allowed_ips       TEXT NOT NULL DEFAULT '[]',
                is_active         INTEGER NOT NULL DEFAULT 1,
                created_at        TEXT NOT NULL,
                updated_at        TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scale_stations_position
                ON scale_stations(position);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Insert a new station at the end of the order, or overwrite an existing
    /// one in place.
    pub fn upsert(&self, station: &ScaleStation) -> Result<(), StoreError> {
        let hostnames = serde_json::to_string(&station.allowed_hostnames)?;
        let ips = serde_json::to_string(&station.allowed_ips)?;
        self.conn().execute(
            "INSERT INTO scale_stations
                (id, position, name, location, allowed_hostnames, allowed_ips,
                 is_active, created_at, updated_at)
             VALUES
                (?1, (SELECT COALESCE(MAX(position), 0) + 1 FROM scale_stations),
                 ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                location = excluded.location,
                allowed_hostnames = excluded.allowed_hostnames,
                allowed_ips = excluded.allowed_ips,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
            params![
                station.id,
                station.name,
                station.location,
                hostnames,
                ips,
                station.is_active,
                station.created_at.to_rfc3339(),
                station.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Returns `true` when a row was deleted.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let n = self
            .conn()
            .execute("DELETE FROM scale_stations WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<ScaleStation>, StoreError> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM scale_stations WHERE id = ?1"),
                params![id],
                RawRow::from_row,
            )
            .optional()?;
        raw.map(RawRow::into_station).transpose()
    }

    /// Every station in registration order.
    pub fn load_all(&self) -> Result<Vec<ScaleStation>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM scale_stations ORDER BY position ASC"
        ))?;
        let rows = stmt.query_map([], RawRow::from_row)?;
        let mut stations = Vec::new();
        for row in rows {
            stations.push(row?.into_station()?);
        }
        Ok(stations)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM scale_stations", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

const COLUMNS: &str =
    "id, name, location, allowed_hostnames, allowed_ips, is_active, created_at, updated_at";

/// Column values before JSON and timestamp decoding.
struct RawRow {
    id: String,
    name: String,
    location: String,
    allowed_hostnames: String,
    allowed_ips: String,
    is_active: bool,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            location: row.get(2)?,
            allowed_hostnames: row.get(3)?,
            allowed_ips: row.get(4)?,
            is_active: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_station(self) -> Result<ScaleStation, StoreError> {
        let created_at = parse_timestamp(&self.id, &self.created_at)?;
        let updated_at = parse_timestamp(&self.id, &self.updated_at)?;
        Ok(ScaleStation {
            allowed_hostnames: serde_json::from_str(&self.allowed_hostnames)?,
            allowed_ips: serde_json::from_str(&self.allowed_ips)?,
            id: self.id,
            name: self.name,
            location: self.location,
            is_active: self.is_active,
            created_at,
            updated_at,
        })
    }
}

fn parse_timestamp(id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("bad timestamp '{raw}': {e}"),
        })
}
