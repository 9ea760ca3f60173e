//! Clock synchronization across devices
//!
//! - [`SyncCoordinator`] runs one sync at a time over a participant set
//! - [`SyncSession`] is the aggregated result of one run

pub mod coordinator;
pub mod state;

pub use coordinator::SyncCoordinator;
pub use state::{SyncError, SyncPhase, SyncResult, SyncSession, SyncSessionState};
