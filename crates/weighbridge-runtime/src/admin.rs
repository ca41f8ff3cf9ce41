//! [`StationAdmin`] – administrative surface over the station registry.
//!
//! Wraps the in-memory [`ScaleRegistry`] with the rules that span crates:
//! access evaluation, write-through persistence to a [`StationStore`], and
//! the guard that a station whose session is in use (subscribed, or still
//! weighing) cannot be deleted unless that session is force-closed first.
//!
//! When a store write fails the registry change is reverted, so memory and
//! disk never disagree about what exists.

use std::sync::Arc;

use tracing::{error, info};
use weighbridge_kernel::{AccessEvaluator, HostnameMatch, ScaleRegistry};
use weighbridge_store::StationStore;
use weighbridge_types::{
    AccessDecision, ClientIdentity, NewStation, ScaleError, ScaleStation, StationPage,
    StationPatch, StationQuery,
};

use crate::hub::BroadcastHub;

pub struct StationAdmin {
    registry: Arc<ScaleRegistry>,
    evaluator: AccessEvaluator,
    hub: Arc<BroadcastHub>,
    store: Option<Arc<StationStore>>,
}

impl StationAdmin {
    pub fn new(registry: Arc<ScaleRegistry>, hub: Arc<BroadcastHub>, policy: HostnameMatch) -> Self {
        Self {
            evaluator: AccessEvaluator::with_policy(Arc::clone(&registry), policy),
            registry,
            hub,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<StationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Load persisted stations into the registry.  Returns how many were
    /// restored; does nothing without a store.
    pub fn load_persisted(&self) -> Result<usize, ScaleError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let stations = store.load_all()?;
        self.registry.restore(stations)
    }

    /// Register `new` unless a station with the same id already exists.
    /// Used for stations declared in configuration, which must not clobber
    /// administrative edits made since.
    pub fn seed(&self, new: NewStation) -> Result<Option<ScaleStation>, ScaleError> {
        if let Some(id) = &new.id
            && self.registry.contains(id.trim())
        {
            return Ok(None);
        }
        self.create(new).map(Some)
    }

    pub fn registry(&self) -> &Arc<ScaleRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    // -- access --------------------------------------------------------------

    pub fn check_access(&self, identity: &ClientIdentity) -> AccessDecision {
        self.evaluator.evaluate(identity)
    }

    pub fn authorize(&self, identity: &ClientIdentity, device_id: &str) -> Result<ScaleStation, ScaleError> {
        self.evaluator.authorize(identity, device_id)
    }

    // -- reads ---------------------------------------------------------------

    pub fn list(&self, query: &StationQuery) -> StationPage {
        self.registry.list(query)
    }

    pub fn get(&self, id: &str) -> Result<ScaleStation, ScaleError> {
        self.registry.get(id)
    }

    // -- writes --------------------------------------------------------------

    pub fn create(&self, new: NewStation) -> Result<ScaleStation, ScaleError> {
        let station = self.registry.register(new)?;
        if let Err(e) = self.persist(&station) {
            let _ = self.registry.remove(&station.id, self.hub.as_ref());
            return Err(e);
        }
        info!(station = %station.id, name = %station.name, "station created");
        Ok(station)
    }

    pub fn update(&self, id: &str, patch: StationPatch) -> Result<ScaleStation, ScaleError> {
        let previous = self.registry.get(id)?;
        let station = self.registry.update(id, patch)?;
        if let Err(e) = self.persist(&station) {
            let _ = self.registry.update(id, restore_patch(&previous));
            return Err(e);
        }
        info!(station = %id, "station updated");
        Ok(station)
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<ScaleStation, ScaleError> {
        let previous = self.registry.get(id)?;
        let station = self.registry.set_active(id, active)?;
        if station.updated_at == previous.updated_at {
            return Ok(station);
        }
        if let Err(e) = self.persist(&station) {
            let _ = self.registry.set_active(id, previous.is_active);
            return Err(e);
        }
        info!(station = %id, active, "station activation changed");
        Ok(station)
    }

    /// Delete a station.  With `force`, a live session is closed first;
    /// without it, a station whose session is still in use is refused.
    pub async fn delete(&self, id: &str, force: bool) -> Result<ScaleStation, ScaleError> {
        self.registry.get(id)?;
        if force {
            self.hub.force_close(id).await;
        }
        let removed = self.registry.remove(id, self.hub.as_ref())?;
        if let Some(store) = &self.store
            && let Err(e) = store.delete(id)
        {
            error!(station = %id, error = %e, "station removed from registry but not from store");
            let _ = self.registry.restore(vec![removed.clone()]);
            return Err(e.into());
        }
        info!(station = %id, "station deleted");
        Ok(removed)
    }

    fn persist(&self, station: &ScaleStation) -> Result<(), ScaleError> {
        match &self.store {
            Some(store) => store.upsert(station).map_err(|e| {
                error!(station = %station.id, error = %e, "station write-through failed");
                ScaleError::from(e)
            }),
            None => Ok(()),
        }
    }
}

fn restore_patch(previous: &ScaleStation) -> StationPatch {
    StationPatch {
        name: Some(previous.name.clone()),
        location: Some(previous.location.clone()),
        allowed_hostnames: Some(previous.allowed_hostnames.clone()),
        allowed_ips: Some(previous.allowed_ips.clone()),
        is_active: Some(previous.is_active),
    }
}
