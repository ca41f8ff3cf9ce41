//! [`LinkRegistry`] – device id → [`HardwareLink`] lookup.
//!
//! The registry is populated once at startup from configuration (or by
//! [`SimFleet`][crate::sim::SimFleet] in tests) and consulted whenever a
//! weighing session has to be created for a device.

use std::collections::HashMap;
use std::sync::Arc;

use crate::link::HardwareLink;

/// Registry of hardware links keyed by device id.
#[derive(Default, Clone)]
pub struct LinkRegistry {
    links: HashMap<String, Arc<dyn HardwareLink>>,
}

impl std::fmt::Debug for LinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkRegistry")
            .field("device_ids", &self.device_ids())
            .finish()
    }
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a link under its own device id.  Any previously registered
    /// link with the same id is replaced and returned.
    pub fn register(&mut self, link: Arc<dyn HardwareLink>) -> Option<Arc<dyn HardwareLink>> {
        self.links.insert(link.device_id().to_string(), link)
    }

    pub fn remove(&mut self, device_id: &str) -> Option<Arc<dyn HardwareLink>> {
        self.links.remove(device_id)
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<dyn HardwareLink>> {
        self.links.get(device_id).cloned()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.links.contains_key(device_id)
    }

    /// Registered device ids, sorted.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.links.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimLink;

    #[test]
    fn register_and_lookup() {
        let mut registry = LinkRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(SimLink::new("S1")));
        registry.register(Arc::new(SimLink::new("A0")));

        assert!(registry.contains("S1"));
        assert_eq!(registry.get("S1").unwrap().device_id(), "S1");
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.device_ids(), vec!["A0".to_string(), "S1".to_string()]);
    }

    #[test]
    fn re_registering_replaces_old_link() {
        let mut registry = LinkRegistry::new();
        registry.register(Arc::new(SimLink::new("S1").with_capacity(100.0)));
        let old = registry.register(Arc::new(SimLink::new("S1").with_capacity(200.0)));

        assert_eq!(old.unwrap().profile().rated_capacity, 100.0);
        assert_eq!(registry.get("S1").unwrap().profile().rated_capacity, 200.0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_drops_link() {
        let mut registry = LinkRegistry::new();
        registry.register(Arc::new(SimLink::new("S1")));
        assert!(registry.remove("S1").is_some());
        assert!(!registry.contains("S1"));
    }
}
