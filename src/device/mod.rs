//! Device layer
//!
//! The transport capability ([`Device`]), the event bus transports publish
//! on, the per-device handle, and the registry that owns all handles.
//! The `simulated` transport is built for tests and with the `simulated`
//! feature.

pub mod events;
pub mod handle;
pub mod registry;
#[cfg(any(test, feature = "simulated"))]
pub mod simulated;
pub mod traits;

pub use events::{DeviceEvent, DeviceEventBus, DeviceEventKind, DeviceEventStream, Next};
pub use handle::{DeviceHandle, DeviceSnapshot, DeviceStatus};
pub use registry::DeviceRegistry;
pub use traits::{
    ConnectionState, Device, DeviceError, DeviceResult, ExportField, MeasurementMode, MfmQuality,
    RecordingAckState, RecordingCommand, RecordingFileInfo, SensorSample, DEFAULT_EXPORT_FIELDS,
};
