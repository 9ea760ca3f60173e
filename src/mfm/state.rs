//! Magnetic field mapping state
//!
//! Per-device status of one mapping run and the report it ends with.

use crate::device::MfmQuality;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Where one device is in a mapping run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MfmStatus {
    Starting,
    /// Collecting data while the user rotates the sensor
    Started,
    /// Data handed off for processing; cannot be cancelled
    Processing,
    /// Writing parameters back; cannot be cancelled
    Writing,
    Finished,
    Disconnected,
    Stopped,
    StartFailed,
    ProcessFailed,
    WriteFailed,
}

impl MfmStatus {
    pub fn is_done(&self) -> bool {
        !matches!(
            self,
            MfmStatus::Starting | MfmStatus::Started | MfmStatus::Processing | MfmStatus::Writing
        )
    }

    pub fn is_cancelable(&self) -> bool {
        matches!(self, MfmStatus::Starting | MfmStatus::Started)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MfmDevice {
    pub address: String,
    pub status: MfmStatus,
    pub percent: u8,
    pub quality: Option<MfmQuality>,

    /// Processed parameters, kept so they can be written again
    #[serde(skip)]
    pub parameters: Option<Vec<u8>>,
}

impl MfmDevice {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            status: MfmStatus::Starting,
            percent: 0,
            quality: None,
            parameters: None,
        }
    }
}

/// How a mapping run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MfmOutcome {
    Completed,
    /// Some devices finished, others failed
    PartiallyCompleted,
    Failed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MfmReport {
    pub outcome: MfmOutcome,
    pub devices: BTreeMap<String, MfmDevice>,
}

impl MfmReport {
    fn with_status(&self, pred: impl Fn(MfmStatus) -> bool) -> Vec<String> {
        self.devices
            .values()
            .filter(|d| pred(d.status))
            .map(|d| d.address.clone())
            .collect()
    }

    pub fn finished(&self) -> Vec<String> {
        self.with_status(|s| s == MfmStatus::Finished)
    }

    pub fn failed(&self) -> Vec<String> {
        self.with_status(|s| s != MfmStatus::Finished)
    }
}

/// Classify a run from the final device states
pub(crate) fn outcome_of(
    devices: &BTreeMap<String, MfmDevice>,
    cancelled: bool,
    timed_out: bool,
) -> MfmOutcome {
    let finished = devices
        .values()
        .filter(|d| d.status == MfmStatus::Finished)
        .count();
    if cancelled {
        MfmOutcome::Cancelled
    } else if finished == devices.len() && finished > 0 {
        MfmOutcome::Completed
    } else if finished > 0 {
        MfmOutcome::PartiallyCompleted
    } else if timed_out {
        MfmOutcome::TimedOut
    } else {
        MfmOutcome::Failed
    }
}

#[derive(Error, Debug)]
pub enum MfmError {
    #[error("a magnetic field mapping is already running")]
    AlreadyRunning,

    #[error("no magnetic field mapping is running")]
    NotRunning,

    #[error("no participants to map")]
    NoParticipants,

    #[error("devices not connected: {not_connected:?}")]
    PreconditionFailed { not_connected: Vec<String> },

    #[error("devices are processing or writing results: {busy:?}")]
    NotCancelable { busy: Vec<String> },

    #[error("no mapping result to write for {address}")]
    NoResult { address: String },

    #[error("failed to write mapping result to {address}: {message}")]
    WriteFailed { address: String, message: String },
}

pub type MfmResult<T> = Result<T, MfmError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn devices(states: &[(&str, MfmStatus)]) -> BTreeMap<String, MfmDevice> {
        states
            .iter()
            .map(|(address, status)| {
                let mut device = MfmDevice::new(*address);
                device.status = *status;
                (address.to_string(), device)
            })
            .collect()
    }

    #[test]
    fn test_outcome() {
        let all = devices(&[("A", MfmStatus::Finished), ("B", MfmStatus::Finished)]);
        assert_eq!(outcome_of(&all, false, false), MfmOutcome::Completed);

        let some = devices(&[("A", MfmStatus::Finished), ("B", MfmStatus::WriteFailed)]);
        assert_eq!(outcome_of(&some, false, true), MfmOutcome::PartiallyCompleted);

        let none = devices(&[("A", MfmStatus::ProcessFailed)]);
        assert_eq!(outcome_of(&none, false, true), MfmOutcome::TimedOut);
        assert_eq!(outcome_of(&none, false, false), MfmOutcome::Failed);
        assert_eq!(outcome_of(&all, true, false), MfmOutcome::Cancelled);
    }

    #[test]
    fn test_processing_is_not_cancelable() {
        assert!(MfmStatus::Started.is_cancelable());
        assert!(!MfmStatus::Processing.is_cancelable());
        assert!(!MfmStatus::Writing.is_done());
        assert!(MfmStatus::StartFailed.is_done());
    }
}
