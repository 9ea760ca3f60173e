//! Per-device outcomes shared by every session report

use serde::{Deserialize, Serialize};

/// Why one device dropped out of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum FailureReason {
    /// Rejected on the only attempt
    CommandFailed { message: String },
    /// Rejected on the first attempt and on the retry
    CommandFailedAfterRetry { message: String },
    /// No longer in the registry
    NotRegistered,
    Disconnected,
    /// Never answered within the wait bound
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFailure {
    pub address: String,
    #[serde(flatten)]
    pub reason: FailureReason,
}

impl DeviceFailure {
    pub fn new(address: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            address: address.into(),
            reason,
        }
    }
}

/// Fan-out of one command across a participant set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReport {
    /// Devices that accepted the command
    pub accepted: Vec<String>,
    pub failed: Vec<DeviceFailure>,
    /// Accepted but never acknowledged within the bound
    pub unacknowledged: Vec<String>,
}

impl CommandReport {
    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty() && self.unacknowledged.is_empty()
    }

    pub fn failed_addresses(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.address.clone()).collect()
    }
}
