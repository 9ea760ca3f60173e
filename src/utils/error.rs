//! Error types and handling
//!
//! Crate-wide error type wrapping every session's own error, plus the
//! classification the UI layer uses to render failures.

use crate::device::DeviceError;
use crate::export::ExportError;
use crate::mfm::MfmError;
use crate::recorder::RecordingError;
use crate::streaming::StreamingError;
use crate::sync::SyncError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Magnetic field mapping error: {0}")]
    Mfm(#[from] MfmError),
}

/// Coarse failure classes shared by every session type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Caller error: devices not connected, not ready, session already running.
    PreconditionFailed,
    /// A device rejected a command even after its retry.
    DeviceCommandFailed,
    /// Enough devices failed that the whole operation is reported failed.
    AggregateFailure,
    /// A barrier or session-wide wait exceeded its bound.
    Timeout,
    /// Directory creation, sink creation, storage.
    ResourceUnavailable,
    /// User-initiated stop.
    Cancelled,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::PreconditionFailed => "PRECONDITION_FAILED",
            ErrorKind::DeviceCommandFailed => "DEVICE_COMMAND_FAILED",
            ErrorKind::AggregateFailure => "AGGREGATE_FAILURE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ResourceUnavailable => "RESOURCE_UNAVAILABLE",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }
}

impl CoordinatorError {
    /// Classify this error for the UI layer
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Io(_) => ErrorKind::ResourceUnavailable,
            CoordinatorError::Config(_) => ErrorKind::PreconditionFailed,
            CoordinatorError::Device(_) => ErrorKind::DeviceCommandFailed,
            CoordinatorError::Sync(e) => match e {
                SyncError::AlreadyInProgress | SyncError::NoParticipants => {
                    ErrorKind::PreconditionFailed
                }
            },
            CoordinatorError::Streaming(e) => match e {
                StreamingError::SinkCreateFailed { .. } => ErrorKind::ResourceUnavailable,
                _ => ErrorKind::PreconditionFailed,
            },
            CoordinatorError::Recording(e) => match e {
                RecordingError::Timeout { .. } => ErrorKind::Timeout,
                _ => ErrorKind::PreconditionFailed,
            },
            CoordinatorError::Export(e) => match e {
                ExportError::SchemaRejectedByAllDevices { .. } | ExportError::AllDevicesFailed(_) => {
                    ErrorKind::AggregateFailure
                }
                ExportError::DirectoryCreateFailed { .. } => ErrorKind::ResourceUnavailable,
                ExportError::Timeout { .. } => ErrorKind::Timeout,
                ExportError::ExportAborted(_) => ErrorKind::Cancelled,
                _ => ErrorKind::PreconditionFailed,
            },
            CoordinatorError::Mfm(e) => match e {
                MfmError::WriteFailed { .. } => ErrorKind::DeviceCommandFailed,
                _ => ErrorKind::PreconditionFailed,
            },
        }
    }
}

/// Error response for frontend
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<CoordinatorError> for ErrorResponse {
    fn from(error: CoordinatorError) -> Self {
        ErrorResponse {
            code: error.kind().code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using CoordinatorError
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_errors_map_to_code() {
        let response: ErrorResponse = CoordinatorError::from(SyncError::NoParticipants).into();
        assert_eq!(response.code, "PRECONDITION_FAILED");
        assert!(response.message.contains("participants"));
    }

    #[test]
    fn test_schema_rejection_is_aggregate_failure() {
        let err = CoordinatorError::from(ExportError::SchemaRejectedByAllDevices {
            failed: vec!["D4:22:CD:00:00:01".into()],
        });
        assert_eq!(err.kind(), ErrorKind::AggregateFailure);
    }

    #[test]
    fn test_mfm_write_failure_is_device_failure() {
        let err = CoordinatorError::from(MfmError::WriteFailed {
            address: "A".into(),
            message: "rejected".into(),
        });
        assert_eq!(err.kind(), ErrorKind::DeviceCommandFailed);
        let err = CoordinatorError::from(MfmError::NotCancelable { busy: vec!["A".into()] });
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }
}
