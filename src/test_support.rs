//! Shared fixtures for session tests

use crate::config::CoordinatorConfig;
use crate::device::simulated::SimulatedDevice;
use crate::device::{
    ConnectionState, DeviceEvent, DeviceEventBus, DeviceEventKind, DeviceHandle, DeviceRegistry,
};
use crate::events::EventEmitter;
use std::sync::Arc;
use tempfile::TempDir;

/// A registry of connected simulated devices plus fast timings
pub struct Rig {
    pub bus: DeviceEventBus,
    pub registry: Arc<DeviceRegistry>,
    pub emitter: EventEmitter,
    pub devices: Vec<Arc<SimulatedDevice>>,
    pub config: CoordinatorConfig,
    pub dir: TempDir,
}

impl Rig {
    pub fn new(addresses: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = CoordinatorConfig {
            command_pacing_ms: 1,
            retry_delay_ms: 1,
            barrier_timeout_ms: 500,
            ack_timeout_ms: 200,
            sync_timeout_ms: 500,
            export_timeout_ms: 1_000,
            mfm_timeout_ms: 1_000,
            log_dir: dir.path().join("logs"),
            export_root: dir.path().to_path_buf(),
            ..CoordinatorConfig::default()
        };
        let bus = DeviceEventBus::new(config.event_capacity);
        let registry = Arc::new(DeviceRegistry::new());
        let mut devices = Vec::new();
        for address in addresses {
            let device = Arc::new(SimulatedDevice::new(*address, format!("DOT {address}"), bus.clone()));
            registry.add(DeviceHandle::new(device.clone()));
            registry.apply_event(&DeviceEvent::new(
                *address,
                DeviceEventKind::ConnectionChanged(ConnectionState::Connected),
            ));
            devices.push(device);
        }
        Self {
            bus,
            registry,
            emitter: EventEmitter::default(),
            devices,
            config,
            dir,
        }
    }

    pub fn device(&self, address: &str) -> &Arc<SimulatedDevice> {
        self.devices
            .iter()
            .find(|d| crate::device::Device::address(d.as_ref()) == address)
            .unwrap()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.registry.addresses()
    }
}
