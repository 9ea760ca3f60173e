//! Streaming commands
//!
//! Live streaming always runs on synchronized sensors: the participants are
//! synchronized first and measurement only starts if every one succeeded.

use super::{fail, AppState, CommandResult};
use crate::streaming::{StreamingStarted, StreamingSummary};
use crate::sync::SyncSession;
use futures::future::join_all;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingStartOutcome {
    pub sync: SyncSession,
    /// `None` when synchronization failed
    pub streaming: Option<StreamingStarted>,
}

/// Synchronize `participants`, then stream from them
pub async fn start_streaming(
    state: &AppState,
    participants: &[String],
) -> CommandResult<StreamingStartOutcome> {
    if state.streaming.is_active() {
        return Err(fail(crate::streaming::StreamingError::AlreadyActive));
    }
    let sync = state
        .sync
        .start_sync(participants, state.config.sync_timeout())
        .await
        .map_err(fail)?;

    if !sync.overall_success {
        tracing::warn!(
            "Not streaming: sync failed on {:?}",
            sync.failed_devices()
        );
        return Ok(StreamingStartOutcome {
            sync,
            streaming: None,
        });
    }

    let streaming = state.streaming.start(participants).await.map_err(fail)?;
    Ok(StreamingStartOutcome {
        sync,
        streaming: Some(streaming),
    })
}

/// Stop measuring, leave sync and close every log
///
/// Also cancels a sync that has not finished yet. `None` when nothing was
/// streaming.
pub async fn stop_streaming(state: &AppState) -> Option<StreamingSummary> {
    state.sync.stop_sync();
    let summary = state.streaming.stop().await?;

    let handles: Vec<_> = summary
        .participants
        .iter()
        .filter_map(|a| state.registry.get(a))
        .collect();
    let results = join_all(handles.iter().map(|h| h.device().stop_syncing())).await;
    for (handle, result) in handles.iter().zip(results) {
        if let Err(e) = result {
            tracing::warn!("Device {} did not stop syncing: {}", handle.address(), e);
        }
        handle.update(|s| s.is_synced = false);
    }
    Some(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::device::connect_device;
    use crate::commands::test_util::{app, sensor, wait_until};
    use crate::device::simulated::{SimCommand, SyncOutcome};

    #[tokio::test]
    async fn test_sync_then_stream() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let mut devices = Vec::new();
        for address in ["A", "B"] {
            let device = sensor(&state, address);
            device.set_behavior(|b| b.samples_per_start = 2);
            connect_device(&state, device.clone()).await.unwrap();
            devices.push(device);
        }
        wait_until(|| state.registry.all_connected()).await;
        let participants = state.registry.addresses();

        let outcome = start_streaming(&state, &participants).await.unwrap();
        assert!(outcome.sync.overall_success);
        let started = outcome.streaming.unwrap();
        assert_eq!(started.log_files.len(), 2);
        let header = std::fs::read_to_string(&started.log_files["A"]).unwrap();
        assert!(header.contains("# Synced: true"));

        let summary = stop_streaming(&state).await.unwrap();
        assert_eq!(summary.participants, participants);
        for device in &devices {
            assert_eq!(device.call_count(SimCommand::StopMeasuring), 1);
            assert_eq!(device.call_count(SimCommand::StopSyncing), 1);
        }
        assert!(!state.registry.get("A").unwrap().status().is_synced);
        assert!(stop_streaming(&state).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_sync_does_not_stream() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let a = sensor(&state, "A");
        let b = sensor(&state, "B");
        b.set_behavior(|b| b.sync = SyncOutcome::Fail);
        connect_device(&state, a.clone()).await.unwrap();
        connect_device(&state, b.clone()).await.unwrap();
        wait_until(|| state.registry.all_connected()).await;

        let outcome = start_streaming(&state, &state.registry.addresses())
            .await
            .unwrap();
        assert!(!outcome.sync.overall_success);
        assert!(outcome.streaming.is_none());
        assert_eq!(a.call_count(SimCommand::StartMeasuring), 0);
        assert!(!state.streaming.is_active());
    }
}
