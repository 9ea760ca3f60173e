//! Device capability definitions
//!
//! Transport-agnostic view of one motion sensor. A transport implementation
//! answers each command with an immediate accept/reject and reports
//! everything else asynchronously through the [`DeviceEventBus`].
//!
//! [`DeviceEventBus`]: super::events::DeviceEventBus

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Link state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The link dropped and the transport is re-establishing it. Sensors
    /// pass through this state while synchronizing.
    Reconnecting,
}

/// Payload a sensor streams while measuring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MeasurementMode {
    CompleteEuler,
    CompleteQuaternion,
    ExtendedEuler,
    ExtendedQuaternion,
    RateQuantities,
    OrientationEuler,
    OrientationQuaternion,
    FreeAcceleration,
}

impl MeasurementMode {
    pub fn label(&self) -> &'static str {
        match self {
            MeasurementMode::CompleteEuler => "Complete (Euler)",
            MeasurementMode::CompleteQuaternion => "Complete (Quaternion)",
            MeasurementMode::ExtendedEuler => "Extended (Euler)",
            MeasurementMode::ExtendedQuaternion => "Extended (Quaternion)",
            MeasurementMode::RateQuantities => "Rate quantities",
            MeasurementMode::OrientationEuler => "Orientation (Euler)",
            MeasurementMode::OrientationQuaternion => "Orientation (Quaternion)",
            MeasurementMode::FreeAcceleration => "Free acceleration",
        }
    }
}

/// One telemetry packet
///
/// Fields the active measurement mode does not carry are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSample {
    pub packet_counter: u32,

    /// Sensor clock in microseconds
    pub sample_time_fine: u64,

    /// Roll, pitch, yaw in degrees
    pub euler: Option<[f64; 3]>,

    /// w, x, y, z
    pub quaternion: Option<[f32; 4]>,

    /// Free acceleration in m/s²
    pub free_acc: Option<[f32; 3]>,

    /// Calibrated acceleration in m/s²
    pub acc: Option<[f64; 3]>,

    /// Calibrated angular velocity in deg/s
    pub gyr: Option<[f64; 3]>,
}

/// A file stored in a sensor's onboard flash
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingFileInfo {
    /// Address of the device holding the file
    pub address: String,
    pub file_id: u32,
    pub file_name: String,
    pub size_bytes: u64,
    /// Unix seconds when the recording started
    pub start_timestamp: i64,
}

/// Quantities that can be included in exported recording data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportField {
    Timestamp,
    Quaternion,
    IQ,
    EulerAngles,
    DeltaV,
    Acceleration,
    AngularVelocity,
    MagneticField,
    Status,
    ClippingCount,
    FreeAcceleration,
    CalibratedAcceleration,
    CalibratedGyroscope,
    CalibratedMagneticField,
}

/// Schema applied when the caller does not choose one
pub const DEFAULT_EXPORT_FIELDS: [ExportField; 4] = [
    ExportField::Timestamp,
    ExportField::EulerAngles,
    ExportField::CalibratedAcceleration,
    ExportField::CalibratedGyroscope,
];

/// Which recording command an acknowledgment answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordingCommand {
    StartRecording,
    StopRecording,
    GetState,
}

/// Recording state carried by an acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordingAckState {
    Success,
    Failed,
    Idle,
    Erasing,
    Recording,
    ExportingFlashInfo,
    ExportingFileInfo,
    ExportingFileData,
}

/// Quality of a processed magnetic field mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MfmQuality {
    NotAvailable,
    Failed,
    Bad,
    Acceptable,
    Good,
}

impl MfmQuality {
    /// Parameters of this quality may be written to the device
    pub fn is_usable(&self) -> bool {
        matches!(self, MfmQuality::Acceptable | MfmQuality::Good)
    }
}

/// Immediate command failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device {0} is not connected")]
    NotConnected(String),

    #[error("device {address} rejected {command}")]
    Rejected { address: String, command: String },

    #[error("transport error: {0}")]
    Transport(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Commands one sensor accepts
///
/// Every method returns once the transport has accepted or rejected the
/// command; results arrive later as device events.
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable unique identifier (the Bluetooth address)
    fn address(&self) -> &str;

    /// Advertised name
    fn name(&self) -> &str;

    async fn connect(&self) -> DeviceResult<()>;

    async fn disconnect(&self) -> DeviceResult<()>;

    async fn start_measuring(&self, mode: MeasurementMode) -> DeviceResult<()>;

    async fn stop_measuring(&self) -> DeviceResult<()>;

    /// Join a synchronization run with `root_address` as the time reference
    async fn start_syncing(&self, root_address: &str) -> DeviceResult<()>;

    async fn stop_syncing(&self) -> DeviceResult<()>;

    async fn enable_recording_notification(&self) -> DeviceResult<()>;

    async fn request_flash_info(&self) -> DeviceResult<()>;

    async fn start_recording(&self) -> DeviceResult<()>;

    async fn stop_recording(&self) -> DeviceResult<()>;

    async fn request_recording_state(&self) -> DeviceResult<()>;

    async fn request_file_info(&self) -> DeviceResult<()>;

    async fn select_exported_data(&self, fields: &[ExportField]) -> DeviceResult<()>;

    /// Transfer `files` into `output_dir`
    async fn start_exporting(
        &self,
        files: &[RecordingFileInfo],
        output_dir: &Path,
    ) -> DeviceResult<()>;

    async fn stop_exporting(&self) -> DeviceResult<()>;

    /// Begin magnetic field mapping; progress arrives as `MfmProgress`
    async fn start_mfm(&self) -> DeviceResult<()>;

    /// Stop collecting mapping data. After full progress this hands the
    /// data off for processing and the result arrives as `MfmCompleted`.
    async fn stop_mfm(&self) -> DeviceResult<()>;

    /// Store processed mapping parameters on the device
    async fn write_mfm_result(&self, parameters: &[u8]) -> DeviceResult<()>;
}
