//! Export module
//!
//! Moves recordings from device flash into a timestamped directory on the
//! host, with a per-device account of what was exported.

pub mod session;
pub mod types;

pub use session::ExportSession;
pub use types::{
    DeviceExportState, ExportError, ExportOutcome, ExportProgress, ExportReport, ExportResult,
    ExportSelection, SchemaSelection,
};
