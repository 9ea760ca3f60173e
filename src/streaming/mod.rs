//! Live measurement across devices
//!
//! - [`StreamingSession`] starts and stops measurement on a participant set
//! - [`CsvSampleLogger`] writes one device's packets to disk

pub mod logger;
pub mod session;

pub use logger::{CsvSampleLogger, LogHeader, SampleSink};
pub use session::{
    StreamingError, StreamingResult, StreamingSession, StreamingStarted, StreamingState,
    StreamingSummary,
};
