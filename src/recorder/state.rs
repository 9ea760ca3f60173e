//! Recording state management
//!
//! Defines the per-device recording flow and the data tracked for each
//! participant of a recording or export session.

use crate::device::RecordingFileInfo;
use crate::session::CommandReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Where one device is in the recording flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordingFlowState {
    Idle,
    NotificationRequested,
    NotificationEnabled,
    NotificationDisabled,
    FlashInfoRequested,
    FlashInfoReceived,
    Recording,
    NotRecording,
    /// Dropped out before answering (disconnected or command rejected)
    Unavailable,
}

impl Default for RecordingFlowState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Recording bookkeeping for one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingData {
    pub address: String,
    pub can_record: bool,
    pub notification_enabled: bool,
    /// Last acknowledged state; not cleared when the device disconnects
    pub is_recording: bool,
    pub flow: RecordingFlowState,
    /// Most recent file first
    pub file_info_list: Vec<RecordingFileInfo>,
}

impl RecordingData {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            can_record: false,
            notification_enabled: false,
            is_recording: false,
            flow: RecordingFlowState::Idle,
            file_info_list: Vec::new(),
        }
    }
}

/// Coarse state of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordingPhase {
    Idle,
    Preparing,
    /// Flash info received from every participant
    Ready,
    Recording,
}

impl Default for RecordingPhase {
    fn default() -> Self {
        Self::Idle
    }
}

/// Result of a completed preparation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingReadiness {
    pub can_record: BTreeMap<String, bool>,
}

impl RecordingReadiness {
    /// Every participant can record
    pub fn all_can_record(&self) -> bool {
        !self.can_record.is_empty() && self.can_record.values().all(|c| *c)
    }

    pub fn blocked(&self) -> Vec<String> {
        self.can_record
            .iter()
            .filter(|(_, can)| !**can)
            .map(|(address, _)| address.clone())
            .collect()
    }
}

/// Whether a device has room for another recording
///
/// Free space is rounded down to a whole percentage; a device at or below
/// `threshold_percent` free is considered full. A device reporting no
/// capacity at all is not blocked.
pub fn can_record_from_flash(used_bytes: u64, total_bytes: u64, threshold_percent: u8) -> bool {
    if total_bytes == 0 {
        return true;
    }
    let free = total_bytes.saturating_sub(used_bytes) as f64 / total_bytes as f64;
    let free_percent = (free * 100.0) as u64;
    free_percent > u64::from(threshold_percent)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordingError {
    #[error("devices not connected: {not_connected:?}")]
    PreconditionFailed { not_connected: Vec<String> },

    #[error("no participants to record")]
    NoParticipants,

    #[error("recording has not been prepared")]
    NotPrepared,

    #[error("devices cannot record: {blocked:?}")]
    NotReady { blocked: Vec<String> },

    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("timed out waiting for {missing:?}")]
    Timeout { missing: Vec<String> },
}

pub type RecordingResult<T> = Result<T, RecordingError>;

/// Per-device result of a start or stop request
pub type RecordingReport = CommandReport;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearly_full_device_cannot_record() {
        assert!(!can_record_from_flash(95, 100, 10));
        assert!(!can_record_from_flash(90, 100, 10));
        assert!(can_record_from_flash(89, 100, 10));
        assert!(can_record_from_flash(0, 100, 10));
    }

    #[test]
    fn test_free_space_rounds_down() {
        // 10.9% free still counts as 10%
        assert!(!can_record_from_flash(891, 1000, 10));
        assert!(can_record_from_flash(880, 1000, 10));
    }

    #[test]
    fn test_zero_capacity_is_not_blocked() {
        assert!(can_record_from_flash(0, 0, 10));
        assert!(!can_record_from_flash(200, 100, 10));
    }

    #[test]
    fn test_readiness_blocked_devices() {
        let readiness = RecordingReadiness {
            can_record: [("A".to_string(), true), ("B".to_string(), false)]
                .into_iter()
                .collect(),
        };
        assert!(!readiness.all_can_record());
        assert_eq!(readiness.blocked(), vec!["B".to_string()]);
    }
}
