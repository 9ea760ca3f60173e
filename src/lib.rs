//! Dot Coordinator - synchronized sessions across wearable motion sensors.
//!
//! This is the main library crate. It tracks connected sensors and runs
//! multi-device sessions over them: clock synchronization, live streaming
//! to per-device logs, on-device recording, export of recorded files and
//! magnetic field mapping.

pub mod commands;
pub mod config;
pub mod device;
pub mod events;
pub mod export;
pub mod mfm;
pub mod recorder;
pub mod session;
pub mod streaming;
pub mod sync;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use commands::AppState;
pub use config::CoordinatorConfig;
pub use utils::error::{CoordinatorError, CoordinatorResult, ErrorKind, ErrorResponse};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dot_coordinator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    tracing::info!("Starting Dot Coordinator v{}", env!("CARGO_PKG_VERSION"));
}
