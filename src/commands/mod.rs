//! Command handlers
//!
//! Intent-level entry points for a UI: each function takes the shared
//! [`AppState`], drives one or more sessions, and returns either a
//! serializable result or an [`ErrorResponse`].

pub mod device;
pub mod export;
pub mod mfm;
pub mod recording;
pub mod streaming;

use crate::config::CoordinatorConfig;
use crate::device::{DeviceEventBus, DeviceRegistry};
use crate::events::{CoordinatorEvent, EventEmitter};
use crate::export::ExportSession;
use crate::mfm::MfmSession;
use crate::recorder::RecordingSession;
use crate::streaming::StreamingSession;
use crate::sync::SyncCoordinator;
use crate::utils::error::{CoordinatorError, ErrorResponse};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub type CommandResult<T> = Result<T, ErrorResponse>;

/// Log and convert a session error for the caller
pub(crate) fn fail<E: Into<CoordinatorError>>(error: E) -> ErrorResponse {
    let error = error.into();
    tracing::error!("{}", error);
    error.into()
}

/// Everything the command handlers share
pub struct AppState {
    pub config: CoordinatorConfig,
    pub bus: DeviceEventBus,
    pub registry: Arc<DeviceRegistry>,
    pub emitter: EventEmitter,
    pub sync: SyncCoordinator,
    pub streaming: StreamingSession,
    pub recording: RecordingSession,
    pub export: Arc<ExportSession>,
    pub mfm: Arc<MfmSession>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// Build every session around one registry and event bus
    ///
    /// Must be called inside a tokio runtime: the registry starts following
    /// the bus immediately.
    pub fn new(config: CoordinatorConfig) -> Self {
        let bus = DeviceEventBus::new(config.event_capacity);
        let registry = Arc::new(DeviceRegistry::new());
        let emitter = EventEmitter::new(config.event_capacity);
        let listener = registry.spawn_event_listener(bus.subscribe());

        let sync = SyncCoordinator::new(Arc::clone(&registry), bus.clone(), emitter.clone());
        let streaming = StreamingSession::new(
            Arc::clone(&registry),
            bus.clone(),
            emitter.clone(),
            config.log_dir.clone(),
            config.measurement_mode,
        );
        let recording =
            RecordingSession::new(Arc::clone(&registry), bus.clone(), emitter.clone(), &config);
        let export = Arc::new(ExportSession::new(
            Arc::clone(&registry),
            bus.clone(),
            emitter.clone(),
            &config,
        ));
        let mfm = Arc::new(MfmSession::new(
            Arc::clone(&registry),
            bus.clone(),
            emitter.clone(),
            &config,
        ));

        tracing::info!("Coordinator ready, logs in {:?}", config.log_dir);
        Self {
            config,
            bus,
            registry,
            emitter,
            sync,
            streaming,
            recording,
            export,
            mfm,
            listener: Mutex::new(Some(listener)),
        }
    }

    /// Stop following the event bus
    pub fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Listen to every coordinator event
pub fn subscribe(state: &AppState) -> broadcast::Receiver<CoordinatorEvent> {
    state.emitter.subscribe()
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::device::simulated::SimulatedDevice;
    use std::time::Duration;
    use tempfile::TempDir;

    pub fn app(dir: &TempDir) -> AppState {
        AppState::new(CoordinatorConfig {
            command_pacing_ms: 1,
            retry_delay_ms: 1,
            barrier_timeout_ms: 500,
            ack_timeout_ms: 200,
            sync_timeout_ms: 500,
            export_timeout_ms: 1_000,
            mfm_timeout_ms: 1_000,
            log_dir: dir.path().join("logs"),
            export_root: dir.path().to_path_buf(),
            ..CoordinatorConfig::default()
        })
    }

    pub fn sensor(state: &AppState, address: &str) -> Arc<SimulatedDevice> {
        Arc::new(SimulatedDevice::new(address, format!("DOT {address}"), state.bus.clone()))
    }

    pub async fn wait_until<F: Fn() -> bool>(f: F) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }
}
