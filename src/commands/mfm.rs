//! Magnetic field mapping commands
//!
//! Data collection waits on the user rotating each sensor, so
//! [`start_mfm`] runs the session in a background task. Per-device state
//! arrives as `mfmProgress` and `mfmStatusChanged` events.

use super::{fail, AppState, CommandResult};
use crate::mfm::{MfmDevice, MfmError};
use tokio::task::JoinHandle;

/// Start mapping on `participants` in the background
pub fn start_mfm(state: &AppState, participants: Vec<String>) -> CommandResult<JoinHandle<()>> {
    if state.mfm.is_running() {
        return Err(fail(MfmError::AlreadyRunning));
    }
    if participants.is_empty() {
        return Err(fail(MfmError::NoParticipants));
    }

    let mfm = state.mfm.clone();
    Ok(tokio::spawn(async move {
        match mfm.start_all(&participants).await {
            Ok(report) => tracing::info!(
                "Mapping finished on {:?}: {:?}",
                report.finished(),
                report.outcome
            ),
            Err(e) => tracing::error!("Mapping failed: {}", e),
        }
    }))
}

pub fn cancel_mfm(state: &AppState) -> CommandResult<()> {
    state.mfm.cancel().map_err(fail)
}

/// Write a device's last mapping result again
pub async fn rewrite_mfm_result(state: &AppState, address: &str) -> CommandResult<MfmDevice> {
    state.mfm.rewrite(address).await.map_err(fail)
}

pub fn mfm_status(state: &AppState) -> Vec<MfmDevice> {
    state.mfm.devices()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::device::connect_device;
    use crate::commands::test_util::{app, sensor, wait_until};
    use crate::device::simulated::SimCommand;
    use crate::events::CoordinatorEvent;
    use crate::mfm::{MfmOutcome, MfmStatus};

    #[tokio::test]
    async fn test_background_mapping_reports_done() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let mut events = crate::commands::subscribe(&state);
        connect_device(&state, sensor(&state, "A")).await.unwrap();
        connect_device(&state, sensor(&state, "B")).await.unwrap();
        wait_until(|| state.registry.all_connected()).await;

        start_mfm(&state, state.registry.addresses())
            .unwrap()
            .await
            .unwrap();
        assert!(mfm_status(&state)
            .iter()
            .all(|d| d.status == MfmStatus::Finished));

        let mut done = None;
        while let Ok(event) = events.try_recv() {
            if let CoordinatorEvent::MfmDone { outcome, .. } = event {
                done = Some(outcome);
            }
        }
        assert_eq!(done, Some(MfmOutcome::Completed));
    }

    #[tokio::test]
    async fn test_rewrite_after_failed_write() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let device = sensor(&state, "A");
        device.set_behavior(|b| {
            b.reject_first.insert(SimCommand::WriteMfmResult, 1);
        });
        connect_device(&state, device.clone()).await.unwrap();
        wait_until(|| state.registry.all_connected()).await;

        start_mfm(&state, vec!["A".into()]).unwrap().await.unwrap();
        assert_eq!(mfm_status(&state)[0].status, MfmStatus::WriteFailed);

        let rewritten = rewrite_mfm_result(&state, "A").await.unwrap();
        assert_eq!(rewritten.status, MfmStatus::Finished);
        assert_eq!(device.call_count(SimCommand::WriteMfmResult), 2);
    }

    #[tokio::test]
    async fn test_cancel_without_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let response = cancel_mfm(&state).unwrap_err();
        assert_eq!(response.code, "PRECONDITION_FAILED");
        assert!(start_mfm(&state, Vec::new()).is_err());
    }
}
