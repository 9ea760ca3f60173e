//! Device registry
//!
//! Owns every currently-known [`DeviceHandle`], keyed by address with
//! insertion order preserved. Mutations take a single writer lock; readers
//! get snapshots so no lock is held across device I/O.

use super::events::{DeviceEvent, DeviceEventKind, DeviceEventStream};
use super::handle::{DeviceHandle, DeviceSnapshot};
use super::traits::{ConnectionState, MeasurementMode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Default)]
struct RegistryInner {
    order: Vec<String>,
    devices: HashMap<String, Arc<DeviceHandle>>,
}

#[derive(Default)]
pub struct DeviceRegistry {
    inner: RwLock<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle; returns false if the address is already known
    pub fn add(&self, handle: DeviceHandle) -> bool {
        let mut inner = self.inner.write();
        if inner.devices.contains_key(handle.address()) {
            return false;
        }
        let address = handle.address().to_string();
        tracing::info!("Registering device {}", address);
        inner.order.push(address.clone());
        inner.devices.insert(address, Arc::new(handle));
        true
    }

    /// Remove a device if present
    pub fn remove(&self, address: &str) -> Option<Arc<DeviceHandle>> {
        let mut inner = self.inner.write();
        let removed = inner.devices.remove(address)?;
        inner.order.retain(|a| a != address);
        tracing::info!("Removed device {}", address);
        Some(removed)
    }

    pub fn get(&self, address: &str) -> Option<Arc<DeviceHandle>> {
        self.inner.read().devices.get(address).cloned()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.inner.read().devices.contains_key(address)
    }

    /// Snapshot of every handle in insertion order
    pub fn all(&self) -> Vec<Arc<DeviceHandle>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|a| inner.devices.get(a).cloned())
            .collect()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.all().iter().map(|h| h.snapshot()).collect()
    }

    /// Run `f` for every connected device
    ///
    /// The lock is released before `f` runs, so `f` may mutate the registry.
    pub fn for_each_connected<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<DeviceHandle>),
    {
        for handle in self.all() {
            if handle.is_connected() {
                f(&handle);
            }
        }
    }

    /// True when the registry is non-empty and every device is connected
    pub fn all_connected(&self) -> bool {
        let devices = self.all();
        !devices.is_empty() && devices.iter().all(|h| h.is_connected())
    }

    /// Addresses among `addresses` that are missing or not connected
    pub fn not_connected(&self, addresses: &[String]) -> Vec<String> {
        addresses
            .iter()
            .filter(|a| !self.get(a).map(|h| h.is_connected()).unwrap_or(false))
            .cloned()
            .collect()
    }

    pub fn set_sync_root(&self, address: &str, is_root: bool) {
        if let Some(handle) = self.get(address) {
            handle.update(|s| s.is_sync_root = is_root);
        }
    }

    pub fn set_measurement_mode(&self, addresses: &[String], mode: MeasurementMode) {
        for address in addresses {
            if let Some(handle) = self.get(address) {
                handle.update(|s| s.measurement_mode = Some(mode));
            }
        }
    }

    /// Reflect a transport callback in the tracked device state
    pub fn apply_event(&self, event: &DeviceEvent) {
        match &event.kind {
            DeviceEventKind::ConnectionChanged(state) => {
                tracing::debug!("Connection of {} changed to {:?}", event.address, state);
                if *state == ConnectionState::Disconnected {
                    self.remove(&event.address);
                } else if let Some(handle) = self.get(&event.address) {
                    handle.update(|s| s.connection_state = *state);
                }
            }
            DeviceEventKind::TagChanged(tag) if !tag.is_empty() => {
                if let Some(handle) = self.get(&event.address) {
                    handle.update(|s| s.tag = tag.clone());
                }
            }
            DeviceEventKind::BatteryChanged { percentage, .. } => {
                if let Some(handle) = self.get(&event.address) {
                    handle.update(|s| s.battery_percentage = Some(*percentage));
                }
            }
            _ => {}
        }
    }

    /// Keep the registry in step with the event bus until it closes
    pub fn spawn_event_listener(self: &Arc<Self>, mut events: DeviceEventStream) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                registry.apply_event(&event);
            }
            tracing::debug!("Device event bus closed, registry listener exiting");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::events::DeviceEventBus;
    use crate::device::simulated::SimulatedDevice;

    fn handle(bus: &DeviceEventBus, address: &str) -> DeviceHandle {
        DeviceHandle::new(Arc::new(SimulatedDevice::new(address, "Xsens DOT", bus.clone())))
    }

    #[test]
    fn test_add_is_idempotent_and_ordered() {
        let bus = DeviceEventBus::new(16);
        let registry = DeviceRegistry::new();
        assert!(registry.add(handle(&bus, "B")));
        assert!(registry.add(handle(&bus, "A")));
        assert!(!registry.add(handle(&bus, "B")));

        assert_eq!(registry.addresses(), vec!["B".to_string(), "A".to_string()]);
    }

    #[test]
    fn test_remove_missing_is_silent() {
        let registry = DeviceRegistry::new();
        assert!(registry.remove("nope").is_none());
    }

    #[test]
    fn test_for_each_connected_can_mutate_registry() {
        let bus = DeviceEventBus::new(16);
        let registry = DeviceRegistry::new();
        registry.add(handle(&bus, "A"));
        registry.add(handle(&bus, "B"));
        registry
            .get("A")
            .unwrap()
            .update(|s| s.connection_state = ConnectionState::Connected);

        let mut visited = Vec::new();
        registry.for_each_connected(|h| {
            visited.push(h.address().to_string());
            registry.remove(h.address());
        });

        assert_eq!(visited, vec!["A".to_string()]);
        assert_eq!(registry.addresses(), vec!["B".to_string()]);
    }

    #[test]
    fn test_disconnect_event_removes_device() {
        let bus = DeviceEventBus::new(16);
        let registry = DeviceRegistry::new();
        registry.add(handle(&bus, "A"));

        registry.apply_event(&DeviceEvent::new(
            "A",
            DeviceEventKind::ConnectionChanged(ConnectionState::Connected),
        ));
        assert!(registry.all_connected());

        registry.apply_event(&DeviceEvent::new(
            "A",
            DeviceEventKind::ConnectionChanged(ConnectionState::Disconnected),
        ));
        assert!(registry.is_empty());
        assert!(!registry.all_connected());
    }

    #[test]
    fn test_tag_event_updates_label() {
        let bus = DeviceEventBus::new(16);
        let registry = DeviceRegistry::new();
        registry.add(handle(&bus, "A"));
        assert_eq!(registry.get("A").unwrap().label(), "Xsens DOT");

        registry.apply_event(&DeviceEvent::new("A", DeviceEventKind::TagChanged("left-wrist".into())));
        assert_eq!(registry.get("A").unwrap().label(), "left-wrist");
    }

    #[test]
    fn test_concurrent_mutation_during_iteration() {
        let bus = DeviceEventBus::new(16);
        let registry = Arc::new(DeviceRegistry::new());
        for i in 0..32 {
            registry.add(handle(&bus, &format!("D{i}")));
        }

        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for i in 0..32 {
                    registry.remove(&format!("D{i}"));
                }
            })
        };
        for _ in 0..32 {
            for h in registry.all() {
                assert!(h.address().starts_with('D'));
            }
        }
        writer.join().unwrap();
        assert!(registry.is_empty());
    }
}
