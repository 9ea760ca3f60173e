//! Export types
//!
//! Selection, per-device progress and final report of an export of
//! on-device recordings, plus the errors that end one early.

use crate::device::{ExportField, RecordingFileInfo};
use crate::session::{DeviceFailure, FailureReason};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Files chosen for export, per device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSelection(BTreeMap<String, Vec<RecordingFileInfo>>);

impl ExportSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add files for `address`; a file already selected is not added twice
    pub fn select<I>(&mut self, address: impl Into<String>, files: I)
    where
        I: IntoIterator<Item = RecordingFileInfo>,
    {
        let list = self.0.entry(address.into()).or_default();
        for file in files {
            if !list.contains(&file) {
                list.push(file);
            }
        }
    }

    pub fn files(&self, address: &str) -> &[RecordingFileInfo] {
        self.0.get(address).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Devices with at least one selected file
    pub fn devices(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|(_, files)| !files.is_empty())
            .map(|(address, _)| address.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub fn file_count(&self, address: &str) -> usize {
        self.files(address).len()
    }
}

/// Result of choosing the data fields to export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSelection {
    pub fields: Vec<ExportField>,
    pub accepted: Vec<String>,
    pub failed: Vec<DeviceFailure>,
}

/// Where one device is in the export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DeviceExportState {
    InProgress,
    Completed,
    /// Confirmed stopped after a cancel
    Stopped,
    Failed(FailureReason),
}

/// Per-device export progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportProgress {
    pub address: String,
    pub exported_files: usize,
    pub selected_files: usize,
    pub percent: f32,
}

impl ExportProgress {
    pub fn new(address: impl Into<String>, exported_files: usize, selected_files: usize) -> Self {
        let percent = if selected_files > 0 {
            (exported_files.min(selected_files) as f32 / selected_files as f32) * 100.0
        } else {
            100.0
        };
        Self {
            address: address.into(),
            exported_files,
            selected_files,
            percent,
        }
    }
}

/// How an export ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportOutcome {
    Running,
    Completed,
    /// Some devices completed, others failed
    PartiallyCompleted,
    Failed,
    TimedOut,
    Aborted,
}

/// Final account of one export
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReport {
    pub directory: PathBuf,
    pub outcome: ExportOutcome,
    /// Devices a start command was issued to
    pub total_exporting_count: usize,
    /// Devices that accepted the start command
    pub in_progress_count: usize,
    pub devices: BTreeMap<String, DeviceExportState>,
    pub exported_files: BTreeMap<String, Vec<RecordingFileInfo>>,
}

impl ExportReport {
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            outcome: ExportOutcome::Running,
            total_exporting_count: 0,
            in_progress_count: 0,
            devices: BTreeMap::new(),
            exported_files: BTreeMap::new(),
        }
    }

    fn with_state(&self, pred: impl Fn(&DeviceExportState) -> bool) -> Vec<String> {
        self.devices
            .iter()
            .filter(|(_, state)| pred(state))
            .map(|(address, _)| address.clone())
            .collect()
    }

    pub fn in_progress(&self) -> Vec<String> {
        self.with_state(|s| *s == DeviceExportState::InProgress)
    }

    pub fn completed(&self) -> Vec<String> {
        self.with_state(|s| *s == DeviceExportState::Completed)
    }

    pub fn failed(&self) -> Vec<DeviceFailure> {
        self.devices
            .iter()
            .filter_map(|(address, state)| match state {
                DeviceExportState::Failed(reason) => {
                    Some(DeviceFailure::new(address.clone(), reason.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn failed_addresses(&self) -> Vec<String> {
        self.with_state(|s| matches!(s, DeviceExportState::Failed(_)))
    }

    /// Move a device out of `InProgress`; terminal states are kept
    pub(crate) fn settle(&mut self, address: &str, state: DeviceExportState) -> bool {
        match self.devices.get_mut(address) {
            Some(current) if *current == DeviceExportState::InProgress => {
                *current = state;
                true
            }
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("an export is already running")]
    AlreadyExporting,

    #[error("export has not been prepared")]
    NotPrepared,

    #[error("no participants to export from")]
    NoParticipants,

    #[error("devices not connected: {not_connected:?}")]
    PreconditionFailed { not_connected: Vec<String> },

    #[error("every device rejected the export fields: {failed:?}")]
    SchemaRejectedByAllDevices { failed: Vec<String> },

    #[error("no files selected for export")]
    NoFilesSelected,

    #[error("failed to create export directory {path:?}: {source}")]
    DirectoryCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out waiting for {pending:?}")]
    Timeout { pending: Vec<String> },

    #[error("every device failed to export")]
    AllDevicesFailed(Box<ExportReport>),

    #[error("export stopped")]
    ExportAborted(Box<ExportReport>),
}

pub type ExportResult<T> = Result<T, ExportError>;
