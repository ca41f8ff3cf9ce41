//! Turns a [`Config`] into a running core: links, hub, store and admin.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use weighbridge_hal::{DeviceProfile, HardwareLink, LinkRegistry, SimLink, TcpLink};
use weighbridge_kernel::ScaleRegistry;
use weighbridge_middleware::EventBus;
use weighbridge_runtime::{BroadcastHub, StationAdmin};
use weighbridge_store::StationStore;

use crate::config::{Config, DeviceConfig, Driver, IN_MEMORY_DB};

/// Build one link per configured device.
pub fn build_links(devices: &[DeviceConfig]) -> Result<LinkRegistry, String> {
    let mut seen = HashSet::new();
    let mut links = LinkRegistry::new();
    for device in devices {
        let id = device.id.trim();
        if id.is_empty() {
            return Err("device with an empty id".to_string());
        }
        if !seen.insert(id.to_string()) {
            return Err(format!("device {id} is declared twice"));
        }
        links.register(build_link(id, device)?);
    }
    Ok(links)
}

fn build_link(id: &str, device: &DeviceConfig) -> Result<Arc<dyn HardwareLink>, String> {
    let link: Arc<dyn HardwareLink> = match device.driver {
        Driver::Sim => Arc::new(
            SimLink::new(id)
                .with_seed(device.seed)
                .with_capacity(device.rated_capacity)
                .with_unit(device.unit)
                .with_load(device.load)
                .with_noise(device.noise),
        ),
        Driver::Tcp => {
            let address = device
                .address
                .as_deref()
                .filter(|a| !a.trim().is_empty())
                .ok_or_else(|| format!("device {id} uses the tcp driver but has no address"))?;
            let profile = DeviceProfile {
                rated_capacity: device.rated_capacity,
                unit: device.unit,
            };
            Arc::new(TcpLink::new(id, address.trim(), profile))
        }
    };
    Ok(link)
}

/// Open the station database, or `None` for in-memory operation.
pub fn open_store(cfg: &Config, config_dir: &Path) -> Result<Option<Arc<StationStore>>, String> {
    let path = cfg.resolved_db_path(config_dir);
    if path.as_os_str() == IN_MEMORY_DB {
        return Ok(None);
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    let store = StationStore::open(&path)
        .map_err(|e| format!("Failed to open station store at {}: {}", path.display(), e))?;
    info!(path = %path.display(), "station store opened");
    Ok(Some(Arc::new(store)))
}

/// Assemble the admin facade (and through it the hub), restore persisted
/// stations and seed the configured ones.
pub fn build_admin(cfg: &Config, config_dir: &Path) -> Result<Arc<StationAdmin>, String> {
    let links = build_links(&cfg.devices)?;

    let mut hub = BroadcastHub::new(links, cfg.engine.to_engine_config())
        .with_bus(EventBus::new(cfg.engine.event_capacity.max(1)));
    if let Some(monitor) = cfg.monitor.to_monitor_config() {
        hub = hub.with_monitor(monitor);
    }

    let mut admin = StationAdmin::new(
        Arc::new(ScaleRegistry::new()),
        Arc::new(hub),
        cfg.access.hostname_match,
    );
    if let Some(store) = open_store(cfg, config_dir)? {
        admin = admin.with_store(store);
    }

    let restored = admin
        .load_persisted()
        .map_err(|e| format!("Failed to restore stations: {}", e))?;
    let mut seeded = 0;
    for station in &cfg.stations {
        match admin.seed(station.clone()) {
            Ok(Some(_)) => seeded += 1,
            Ok(None) => {}
            Err(e) => warn!(station = %station.name, error = %e, "configured station rejected"),
        }
    }
    info!(restored, seeded, devices = cfg.devices.len(), "core assembled");

    for device in &cfg.devices {
        if !admin.registry().contains(device.id.trim()) {
            warn!(device = %device.id, "device has no station; nobody can subscribe to it");
        }
    }
    Ok(Arc::new(admin))
}
