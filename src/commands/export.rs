//! Export commands
//!
//! An export can run for minutes, so [`export_recordings`] starts it in a
//! background task and the outcome is delivered as coordinator events.

use super::{fail, AppState, CommandResult};
use crate::device::{ExportField, RecordingFileInfo};
use crate::export::{ExportError, ExportSelection, SchemaSelection};
use crate::session::CommandReport;
use std::collections::BTreeMap;
use tokio::task::JoinHandle;

/// List the recorded files on every participant
pub async fn prepare_export(
    state: &AppState,
    participants: &[String],
) -> CommandResult<BTreeMap<String, Vec<RecordingFileInfo>>> {
    state.export.prepare(participants).await.map_err(fail)
}

pub async fn select_export_fields(
    state: &AppState,
    fields: &[ExportField],
) -> CommandResult<SchemaSelection> {
    state.export.select_export_fields(fields).await.map_err(fail)
}

/// Start exporting `selection` in the background
///
/// Progress and the final result arrive as `exportProgress`, `exportDone`
/// and `exportFailed` events.
pub fn export_recordings(
    state: &AppState,
    selection: ExportSelection,
) -> CommandResult<JoinHandle<()>> {
    if state.export.is_exporting() {
        return Err(fail(ExportError::AlreadyExporting));
    }
    if selection.is_empty() {
        return Err(fail(ExportError::NoFilesSelected));
    }

    let export = state.export.clone();
    Ok(tokio::spawn(async move {
        match export.start_exporting(&selection).await {
            Ok(report) => tracing::info!(
                "Export into {:?} finished: {:?}",
                report.directory,
                report.outcome
            ),
            Err(e) => tracing::error!("Export failed: {}", e),
        }
    }))
}

/// Stop the running export
pub async fn cancel_export(state: &AppState) -> CommandResult<CommandReport> {
    if !state.export.is_exporting() {
        return Err(fail(ExportError::NotPrepared));
    }
    tracing::info!("Cancelling export");
    Ok(state.export.stop_exporting().await)
}

pub fn is_exporting(state: &AppState) -> bool {
    state.export.is_exporting()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::device::connect_device;
    use crate::commands::test_util::{app, sensor, wait_until};
    use crate::events::CoordinatorEvent;

    #[tokio::test]
    async fn test_background_export_reports_done() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        let mut events = crate::commands::subscribe(&state);
        let device = sensor(&state, "A");
        let files = vec![device.file(1, "rec1", 2048, 1_700_000_000)];
        device.set_behavior(|b| b.files = files);
        connect_device(&state, device).await.unwrap();
        wait_until(|| state.registry.all_connected()).await;

        let lists = prepare_export(&state, &state.registry.addresses())
            .await
            .unwrap();
        let mut selection = ExportSelection::new();
        selection.select("A", lists["A"].iter().cloned());

        export_recordings(&state, selection).unwrap().await.unwrap();
        assert!(!is_exporting(&state));

        let mut done = None;
        while let Ok(event) = events.try_recv() {
            if let CoordinatorEvent::ExportDone { completed, .. } = event {
                done = Some(completed);
            }
        }
        assert_eq!(done, Some(vec!["A".to_string()]));
    }

    #[tokio::test]
    async fn test_cancel_without_export() {
        let dir = tempfile::tempdir().unwrap();
        let state = app(&dir);
        assert!(cancel_export(&state).await.is_err());
        assert!(export_recordings(&state, ExportSelection::new()).is_err());
    }
}
