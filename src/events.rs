//! Outward-facing coordinator events
//!
//! One event per aggregated operation, carrying the addresses involved and
//! enough state for a UI to render without querying the registry.

use crate::device::RecordingFileInfo;
use crate::mfm::{MfmOutcome, MfmStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoordinatorEvent {
    #[serde(rename_all = "camelCase")]
    SyncStarted {
        request_id: Uuid,
        participants: Vec<String>,
        root: String,
    },
    /// Most recent progress reported by any participant
    #[serde(rename_all = "camelCase")]
    SyncProgress {
        request_id: Uuid,
        address: String,
        progress: u8,
    },
    #[serde(rename_all = "camelCase")]
    SyncDone {
        request_id: Uuid,
        success: bool,
        results: BTreeMap<String, bool>,
        failed: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    StreamingStarted {
        participants: Vec<String>,
        log_files: Vec<PathBuf>,
    },
    #[serde(rename_all = "camelCase")]
    StreamingStopped {
        participants: Vec<String>,
        samples_written: BTreeMap<String, u64>,
    },
    /// Every participant reported flash info
    #[serde(rename_all = "camelCase")]
    RecordingReady {
        can_record: BTreeMap<String, bool>,
        ready: bool,
    },
    #[serde(rename_all = "camelCase")]
    RecordingStateChanged { address: String, is_recording: bool },
    #[serde(rename_all = "camelCase")]
    FileInfoReceived {
        address: String,
        files: Vec<RecordingFileInfo>,
    },
    #[serde(rename_all = "camelCase")]
    ExportStarted {
        directory: PathBuf,
        in_progress: Vec<String>,
        failed: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    ExportProgress {
        address: String,
        file: RecordingFileInfo,
        exported_files: usize,
    },
    #[serde(rename_all = "camelCase")]
    ExportDeviceDone { address: String },
    #[serde(rename_all = "camelCase")]
    ExportDone {
        directory: PathBuf,
        completed: Vec<String>,
        failed: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    ExportFailed {
        directory: Option<PathBuf>,
        reason: String,
        failed: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    MfmStarted { participants: Vec<String> },
    #[serde(rename_all = "camelCase")]
    MfmProgress { address: String, percent: u8 },
    #[serde(rename_all = "camelCase")]
    MfmStatusChanged { address: String, status: MfmStatus },
    #[serde(rename_all = "camelCase")]
    MfmDone {
        outcome: MfmOutcome,
        finished: Vec<String>,
        failed: Vec<String>,
    },
}

/// Broadcasts [`CoordinatorEvent`]s to any number of listeners
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<CoordinatorEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: CoordinatorEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Coordinator event dropped: no listeners");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = CoordinatorEvent::RecordingStateChanged {
            address: "D4:22:CD:00:00:01".into(),
            is_recording: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "recordingStateChanged");
        assert_eq!(json["isRecording"], true);
    }

    #[test]
    fn test_mfm_status_serializes_camel_case() {
        let event = CoordinatorEvent::MfmStatusChanged {
            address: "A".into(),
            status: MfmStatus::ProcessFailed,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "mfmStatusChanged");
        assert_eq!(json["status"], "processFailed");
    }
}
