//! [`ScaleRegistry`] – the registered scale stations.
//!
//! Many readers (every access check) and rare writers (admin actions).  All
//! writes happen under a single write lock and replace whole station records,
//! so a reader sees either the old or the new version of a station, never a
//! mix.  Iteration order is registration order, which is what makes the
//! "first matching station" of an access check deterministic.

use std::net::IpAddr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::info;
use weighbridge_types::{
    NewStation, ScaleError, ScaleStation, StationPage, StationPatch, StationQuery, normalize_ip,
};

/// Page size used when only `page` is supplied.
pub const DEFAULT_PAGE_LIMIT: usize = 10;

/// Answers whether a device's session is still in use: somebody is
/// subscribed, or the device is mid-weighing.
///
/// Implemented by the session hub; the registry only needs the answer to
/// refuse deleting a station that is in use.
pub trait SessionLocator: Send + Sync {
    fn has_active_session(&self, device_id: &str) -> bool;
}

/// Registry of [`ScaleStation`]s in registration order.
#[derive(Default)]
pub struct ScaleRegistry {
    stations: RwLock<Vec<ScaleStation>>,
}

impl ScaleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new station.
    ///
    /// # Errors
    ///
    /// - [`ScaleError::DuplicateId`] – a station with the same id exists.
    /// - [`ScaleError::InvalidOperation`] – empty name or a non-IP entry in
    ///   `allowed_ips`.
    pub fn register(&self, new: NewStation) -> Result<ScaleStation, ScaleError> {
        let station = sanitize(new.into_station(Utc::now()))?;
        let mut stations = self.write();
        if stations.iter().any(|s| s.id == station.id) {
            return Err(ScaleError::DuplicateId(station.id));
        }
        stations.push(station.clone());
        info!(station = %station.id, name = %station.name, "station registered");
        Ok(station)
    }

    /// Restore previously persisted stations, keeping their ids and
    /// timestamps.  All-or-nothing: a single duplicate rejects the batch.
    pub fn restore(&self, records: Vec<ScaleStation>) -> Result<usize, ScaleError> {
        let mut stations = self.write();
        for (i, record) in records.iter().enumerate() {
            let clash = stations.iter().any(|s| s.id == record.id)
                || records[..i].iter().any(|r| r.id == record.id);
            if clash {
                return Err(ScaleError::DuplicateId(record.id.clone()));
            }
        }
        let count = records.len();
        stations.extend(records);
        Ok(count)
    }

    pub fn get(&self, id: &str) -> Result<ScaleStation, ScaleError> {
        self.read()
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| ScaleError::NotFound(format!("station {id}")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().iter().any(|s| s.id == id)
    }

    /// Apply a partial update.  Unspecified fields are left unchanged.
    pub fn update(&self, id: &str, patch: StationPatch) -> Result<ScaleStation, ScaleError> {
        let mut stations = self.write();
        let slot = stations
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| ScaleError::NotFound(format!("station {id}")))?;

        let mut next = slot.clone();
        if let Some(name) = patch.name {
            next.name = name;
        }
        if let Some(location) = patch.location {
            next.location = location;
        }
        if let Some(hostnames) = patch.allowed_hostnames {
            next.allowed_hostnames = hostnames;
        }
        if let Some(ips) = patch.allowed_ips {
            next.allowed_ips = ips;
        }
        if let Some(active) = patch.is_active {
            next.is_active = active;
        }
        let mut next = sanitize(next)?;
        next.updated_at = Utc::now();
        *slot = next.clone();
        info!(station = %id, "station updated");
        Ok(next)
    }

    /// Set the active flag.  Setting the current value again changes nothing.
    pub fn set_active(&self, id: &str, active: bool) -> Result<ScaleStation, ScaleError> {
        let mut stations = self.write();
        let slot = stations
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| ScaleError::NotFound(format!("station {id}")))?;
        if slot.is_active != active {
            slot.is_active = active;
            slot.updated_at = Utc::now();
            info!(station = %id, active, "station toggled");
        }
        Ok(slot.clone())
    }

    /// Remove a station.
    ///
    /// # Errors
    ///
    /// - [`ScaleError::NotFound`] – no such station.
    /// - [`ScaleError::HasActiveSession`] – the device's session is still in
    ///   use; the caller must force-close it first.
    pub fn remove(&self, id: &str, sessions: &dyn SessionLocator) -> Result<ScaleStation, ScaleError> {
        let mut stations = self.write();
        let index = stations
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| ScaleError::NotFound(format!("station {id}")))?;
        if sessions.has_active_session(id) {
            return Err(ScaleError::HasActiveSession(id.to_string()));
        }
        let removed = stations.remove(index);
        info!(station = %id, "station removed");
        Ok(removed)
    }

    /// List stations, optionally filtered and paginated.
    ///
    /// The search term matches name, location, any allowed IP, or any
    /// allowed hostname, case-insensitively.  Without `page` and `limit` the
    /// whole filtered set is returned and the pagination fields are `None`.
    pub fn list(&self, query: &StationQuery) -> StationPage {
        let needle = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let matching: Vec<ScaleStation> = self
            .read()
            .iter()
            .filter(|s| needle.as_deref().is_none_or(|n| station_matches_search(s, n)))
            .cloned()
            .collect();
        let total = matching.len();

        if !query.is_paginated() {
            return StationPage {
                stations: matching,
                total,
                page: None,
                limit: None,
                total_pages: None,
            };
        }

        let page = query.page.unwrap_or(1).max(1);
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).max(1);
        let stations = matching
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .collect();
        StationPage {
            stations,
            total,
            page: Some(page),
            limit: Some(limit),
            total_pages: Some(total.div_ceil(limit)),
        }
    }

    /// Snapshot of every station in registration order.
    pub fn stations(&self) -> Vec<ScaleStation> {
        self.read().clone()
    }

    /// Every IP allowed by an active station, de-duplicated, first-seen order.
    pub fn allowed_ips(&self) -> Vec<String> {
        collect_allowed_ips(&self.read())
    }

    /// Run `f` against a consistent view of all stations.
    pub fn with_stations<R>(&self, f: impl FnOnce(&[ScaleStation]) -> R) -> R {
        f(&self.read())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<ScaleStation>> {
        self.stations.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<ScaleStation>> {
        self.stations.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn collect_allowed_ips(stations: &[ScaleStation]) -> Vec<String> {
    let mut ips: Vec<String> = Vec::new();
    for ip in stations
        .iter()
        .filter(|s| s.is_active)
        .flat_map(|s| s.allowed_ips.iter())
    {
        if !ips.contains(ip) {
            ips.push(ip.clone());
        }
    }
    ips
}

fn station_matches_search(station: &ScaleStation, needle: &str) -> bool {
    station.name.to_lowercase().contains(needle)
        || station.location.to_lowercase().contains(needle)
        || station.allowed_ips.iter().any(|ip| ip.to_lowercase().contains(needle))
        || station
            .allowed_hostnames
            .iter()
            .any(|h| h.to_lowercase().contains(needle))
}

/// Trim and validate a station record before it is stored.
fn sanitize(mut station: ScaleStation) -> Result<ScaleStation, ScaleError> {
    station.id = station.id.trim().to_string();
    station.name = station.name.trim().to_string();
    station.location = station.location.trim().to_string();
    if station.id.is_empty() {
        return Err(ScaleError::InvalidOperation("station id must not be empty".into()));
    }
    if station.name.is_empty() {
        return Err(ScaleError::InvalidOperation("station name must not be empty".into()));
    }

    station.allowed_hostnames = station
        .allowed_hostnames
        .iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect();

    let mut ips = Vec::with_capacity(station.allowed_ips.len());
    for raw in station.allowed_ips.iter().filter(|ip| !ip.trim().is_empty()) {
        let ip = normalize_ip(raw);
        if ip.parse::<IpAddr>().is_err() {
            return Err(ScaleError::InvalidOperation(format!(
                "'{raw}' is not an IP address"
            )));
        }
        ips.push(ip);
    }
    station.allowed_ips = ips;
    Ok(station)
}
