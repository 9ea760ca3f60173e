//! Device connection commands

use super::{fail, AppState, CommandResult};
use crate::device::{Device, DeviceError, DeviceHandle, DeviceSnapshot};
use futures::future::join_all;
use std::sync::Arc;

/// Register a sensor and ask it to connect
///
/// The connection state follows the transport's callbacks; the returned
/// snapshot reflects the state at the time the command was accepted.
pub async fn connect_device(state: &AppState, device: Arc<dyn Device>) -> CommandResult<DeviceSnapshot> {
    let address = device.address().to_string();
    if !state.registry.add(DeviceHandle::new(device)) {
        tracing::debug!("Device {} already registered", address);
    }
    let handle = state
        .registry
        .get(&address)
        .ok_or_else(|| fail(DeviceError::NotConnected(address.clone())))?;
    if handle.is_connected() {
        return Ok(handle.snapshot());
    }

    tracing::info!("Connecting to {}", address);
    if let Err(e) = handle.device().connect().await {
        state.registry.remove(&address);
        return Err(fail(e));
    }
    Ok(handle.snapshot())
}

/// Ask one sensor to disconnect; it leaves the registry once it reports
/// the disconnection
pub async fn disconnect_device(state: &AppState, address: &str) -> CommandResult<()> {
    let handle = state
        .registry
        .get(address)
        .ok_or_else(|| fail(DeviceError::NotConnected(address.to_string())))?;
    tracing::info!("Disconnecting {}", address);
    handle.device().disconnect().await.map_err(fail)
}

/// Disconnect every registered sensor; failures are logged and skipped
pub async fn disconnect_all(state: &AppState) {
    let handles = state.registry.all();
    let results = join_all(handles.iter().map(|h| h.device().disconnect())).await;
    for (handle, result) in handles.iter().zip(results) {
        if let Err(e) = result {
            tracing::warn!("Failed to disconnect {}: {}", handle.address(), e);
        }
    }
}

pub fn list_devices(state: &AppState) -> Vec<DeviceSnapshot> {
    state.registry.snapshots()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_util::{app, sensor, wait_until};
    use crate::device::simulated::SimCommand;
    use crate::device::ConnectionState;

    #[tokio::test]
    async fn test_connect_then_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let device = sensor(&state, "A");

        connect_device(&state, device.clone()).await.unwrap();
        wait_until(|| {
            state
                .registry
                .get("A")
                .map(|h| h.connection_state() == ConnectionState::Connected)
                .unwrap_or(false)
        })
        .await;
        assert_eq!(list_devices(&state).len(), 1);

        disconnect_device(&state, "A").await.unwrap();
        wait_until(|| state.registry.is_empty()).await;
        assert_eq!(device.call_count(SimCommand::Disconnect), 1);
    }

    #[tokio::test]
    async fn test_rejected_connect_is_not_registered() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let device = sensor(&state, "A");
        device.set_behavior(|b| {
            b.reject_always.insert(SimCommand::Connect);
        });

        let err = connect_device(&state, device).await.unwrap_err();
        assert_eq!(err.code, "DEVICE_COMMAND_FAILED");
        assert!(list_devices(&state).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_unknown_device() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        assert!(disconnect_device(&state, "Z").await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        for address in ["A", "B"] {
            connect_device(&state, sensor(&state, address)).await.unwrap();
        }
        wait_until(|| state.registry.all_connected()).await;

        disconnect_all(&state).await;
        wait_until(|| state.registry.is_empty()).await;
    }
}
