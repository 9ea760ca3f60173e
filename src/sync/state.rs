//! Sync state management
//!
//! Defines the coordinator state machine and the per-operation session
//! record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Current state of the sync coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum SyncPhase {
    /// No sync in progress
    Idle,
    /// Root chosen, device commands not yet issued
    RootAssigned,
    /// Waiting for participants to report
    SyncInProgress { progress: u8 },
    /// Every participant reported success
    AllSucceeded,
    /// At least one participant failed
    AnyFailed,
}

impl Default for SyncPhase {
    fn default() -> Self {
        Self::Idle
    }
}

/// Lifecycle of one sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SyncSessionState {
    Started,
    InProgress { progress: u8 },
    Done,
}

/// One synchronization run over a fixed participant set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub request_id: Uuid,

    /// Participants in the order given; the first one is the root
    pub participants: Vec<String>,

    pub root: String,

    /// Result reported by (or assigned to) each participant
    pub per_device_result: BTreeMap<String, bool>,

    /// Logical AND over every participant
    pub overall_success: bool,

    pub state: SyncSessionState,

    /// The wait ended before every participant reported
    pub timed_out: bool,

    /// Stopped by the caller
    pub cancelled: bool,
}

impl SyncSession {
    pub fn new(request_id: Uuid, participants: Vec<String>) -> Self {
        let root = participants.first().cloned().unwrap_or_default();
        Self {
            request_id,
            participants,
            root,
            per_device_result: BTreeMap::new(),
            overall_success: false,
            state: SyncSessionState::Started,
            timed_out: false,
            cancelled: false,
        }
    }

    pub fn is_participant(&self, address: &str) -> bool {
        self.participants.iter().any(|p| p == address)
    }

    /// Record a participant's result; the first report for a device wins
    pub fn record(&mut self, address: &str, success: bool) -> bool {
        if !self.is_participant(address) || self.per_device_result.contains_key(address) {
            return false;
        }
        self.per_device_result.insert(address.to_string(), success);
        true
    }

    /// Last-writer-wins progress across all participants
    pub fn set_progress(&mut self, progress: u8) {
        self.state = SyncSessionState::InProgress {
            progress: progress.min(100),
        };
    }

    pub fn is_complete(&self) -> bool {
        self.participants
            .iter()
            .all(|p| self.per_device_result.contains_key(p))
    }

    /// Participants that have not reported
    pub fn pending(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| !self.per_device_result.contains_key(*p))
            .cloned()
            .collect()
    }

    /// Close the session: unanswered participants count as failures
    pub fn finish(&mut self) {
        for address in self.pending() {
            self.per_device_result.insert(address, false);
        }
        self.overall_success = !self.participants.is_empty()
            && self.participants.iter().all(|p| self.per_device_result[p]);
        self.state = SyncSessionState::Done;
    }

    pub fn failed_devices(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| !self.per_device_result.get(*p).copied().unwrap_or(false))
            .cloned()
            .collect()
    }

    pub fn succeeded_devices(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| self.per_device_result.get(*p).copied().unwrap_or(false))
            .cloned()
            .collect()
    }
}

/// Errors that prevent a sync from starting
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("a sync operation is already in progress")]
    AlreadyInProgress,

    #[error("no participants to synchronize")]
    NoParticipants,
}

pub type SyncResult<T> = Result<T, SyncError>;
