//! Recording commands

use super::{fail, AppState, CommandResult};
use crate::device::RecordingFileInfo;
use crate::recorder::{RecordingReadiness, RecordingReport};
use std::collections::BTreeMap;

/// Read flash info on every participant and report who can record
pub async fn prepare_recording(
    state: &AppState,
    participants: &[String],
) -> CommandResult<RecordingReadiness> {
    state.recording.prepare(participants).await.map_err(fail)
}

pub async fn start_recording(state: &AppState) -> CommandResult<RecordingReport> {
    state.recording.start_recording().await.map_err(fail)
}

pub async fn stop_recording(state: &AppState) -> RecordingReport {
    state.recording.stop_recording().await
}

pub async fn request_file_info(
    state: &AppState,
) -> CommandResult<BTreeMap<String, Vec<RecordingFileInfo>>> {
    state.recording.request_file_info().await.map_err(fail)
}

/// Re-read the recording state of every participant
pub async fn query_recording_state(state: &AppState) -> CommandResult<BTreeMap<String, bool>> {
    state.recording.query_recording_state().await.map_err(fail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::device::connect_device;
    use crate::commands::test_util::{app, sensor, wait_until};
    use crate::events::CoordinatorEvent;

    #[tokio::test]
    async fn test_record_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let mut events = crate::commands::subscribe(&state);
        for address in ["A", "B"] {
            connect_device(&state, sensor(&state, address)).await.unwrap();
        }
        wait_until(|| state.registry.all_connected()).await;
        let participants = state.registry.addresses();

        let readiness = prepare_recording(&state, &participants).await.unwrap();
        assert!(readiness.all_can_record());

        let report = start_recording(&state).await.unwrap();
        assert!(report.is_complete_success());
        let states = query_recording_state(&state).await.unwrap();
        assert!(states.values().all(|r| *r));

        let report = stop_recording(&state).await;
        assert_eq!(report.accepted.len(), 2);
        let states = query_recording_state(&state).await.unwrap();
        assert!(states.values().all(|r| !*r));

        let mut saw_ready = false;
        while let Ok(event) = events.try_recv() {
            if let CoordinatorEvent::RecordingReady { ready, .. } = event {
                saw_ready = ready;
            }
        }
        assert!(saw_ready);
    }

    #[tokio::test]
    async fn test_start_without_prepare_is_precondition_failure() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let err = start_recording(&state).await.unwrap_err();
        assert_eq!(err.code, "PRECONDITION_FAILED");
    }
}
