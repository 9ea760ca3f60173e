//! Building blocks shared by every session type
//!
//! - [`ResponseBarrier`] joins the asynchronous replies of N devices
//! - [`CommandPacer`] paces and retries device commands
//! - [`SessionSlot`] keeps at most one session of a kind active

pub mod barrier;
pub mod pacing;
pub mod report;
pub mod slot;

pub use barrier::{Arrival, ResponseBarrier};
pub use pacing::{CommandOutcome, CommandPacer};
pub use report::{CommandReport, DeviceFailure, FailureReason};
pub use slot::{SessionSlot, SlotGuard};
