//! Device handle
//!
//! Pairs a transport [`Device`] with the coordinator's view of its state.

use super::traits::{ConnectionState, Device, MeasurementMode};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Mutable per-device state tracked by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub display_name: String,

    /// User-assigned tag; empty until the device reports one
    pub tag: String,

    pub connection_state: ConnectionState,

    /// Time reference for the running sync operation
    pub is_sync_root: bool,

    /// Result of the last completed sync
    pub is_synced: bool,

    pub measurement_mode: Option<MeasurementMode>,

    pub is_recording: bool,

    pub can_record: bool,

    pub notification_enabled: bool,

    pub battery_percentage: Option<u8>,
}

/// Render-ready copy of one device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub address: String,
    #[serde(flatten)]
    pub status: DeviceStatus,
}

/// One physical sensor as known to the registry
pub struct DeviceHandle {
    address: String,
    device: Arc<dyn Device>,
    status: RwLock<DeviceStatus>,
}

impl DeviceHandle {
    pub fn new(device: Arc<dyn Device>) -> Self {
        let address = device.address().to_string();
        let status = DeviceStatus {
            display_name: device.name().to_string(),
            tag: String::new(),
            connection_state: ConnectionState::Disconnected,
            is_sync_root: false,
            is_synced: false,
            measurement_mode: None,
            is_recording: false,
            can_record: false,
            notification_enabled: false,
            battery_percentage: None,
        };
        Self {
            address,
            device,
            status: RwLock::new(status),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Transport used to issue commands
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn status(&self) -> DeviceStatus {
        self.status.read().clone()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            address: self.address.clone(),
            status: self.status(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status.read().connection_state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Tag if set, otherwise the advertised name
    pub fn label(&self) -> String {
        let status = self.status.read();
        if status.tag.is_empty() {
            status.display_name.clone()
        } else {
            status.tag.clone()
        }
    }

    /// Apply a change to the tracked state
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut DeviceStatus),
    {
        f(&mut self.status.write());
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("address", &self.address)
            .field("status", &*self.status.read())
            .finish()
    }
}
