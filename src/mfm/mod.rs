//! Magnetic field mapping
//!
//! Calibrates each sensor's magnetometer against its surroundings. The
//! sensor collects data while the user rotates it, then processes it and
//! hands back parameters that are written to the device.

pub mod session;
pub mod state;

pub use session::MfmSession;
pub use state::{MfmDevice, MfmError, MfmOutcome, MfmReport, MfmResult, MfmStatus};
