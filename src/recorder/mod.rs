//! Recording module
//!
//! On-device recording across a participant set:
//! - [`RecordingFlow`] drives notification, flash info and file listing
//! - [`RecordingSession`] gates, starts and stops recording

pub mod flow;
pub mod session;
pub mod state;

pub use flow::RecordingFlow;
pub use session::RecordingSession;
pub use state::{
    can_record_from_flash, RecordingData, RecordingError, RecordingFlowState, RecordingPhase,
    RecordingReadiness, RecordingReport, RecordingResult,
};
