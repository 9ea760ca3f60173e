//! Streaming session
//!
//! Starts measurement on a participant set, routes every telemetry packet
//! into the sending device's own log sink, and closes all sinks on stop.

use super::logger::{sanitize_label, CsvSampleLogger, LogHeader, SampleSink};
use crate::device::{
    DeviceEvent, DeviceEventBus, DeviceEventKind, DeviceEventStream, DeviceRegistry,
    MeasurementMode, SensorSample,
};
use crate::events::{CoordinatorEvent, EventEmitter};
use crate::session::{SessionSlot, SlotGuard};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum StreamingError {
    #[error("a streaming session is already active")]
    AlreadyActive,

    #[error("no participants to stream from")]
    NoParticipants,

    #[error("devices not connected: {not_connected:?}")]
    PreconditionFailed { not_connected: Vec<String> },

    #[error("failed to create log for {label}: {source}")]
    SinkCreateFailed {
        label: String,
        #[source]
        source: std::io::Error,
    },
}

pub type StreamingResult<T> = Result<T, StreamingError>;

/// Current state of the streaming session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum StreamingState {
    Idle,
    Active {
        participants: Vec<String>,
        started_at: DateTime<Utc>,
    },
}

/// Result of a successful start
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingStarted {
    pub log_files: BTreeMap<String, PathBuf>,
    /// Devices that rejected "begin measurement"
    pub failed: Vec<String>,
}

/// Result of stopping an active session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingSummary {
    pub participants: Vec<String>,
    pub log_files: BTreeMap<String, PathBuf>,
    pub samples_written: BTreeMap<String, u64>,
}

struct ActiveStream {
    participants: Vec<String>,
    started_at: DateTime<Utc>,
    log_files: BTreeMap<String, PathBuf>,
    cancel: CancellationToken,
    router: JoinHandle<BTreeMap<String, u64>>,
    _guard: SlotGuard,
}

pub struct StreamingSession {
    registry: Arc<DeviceRegistry>,
    bus: DeviceEventBus,
    emitter: EventEmitter,
    log_dir: PathBuf,
    mode: MeasurementMode,
    slot: SessionSlot,
    active: Mutex<Option<ActiveStream>>,

    /// Most recent packet per device, for display
    latest: Arc<RwLock<HashMap<String, SensorSample>>>,
}

impl StreamingSession {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        bus: DeviceEventBus,
        emitter: EventEmitter,
        log_dir: PathBuf,
        mode: MeasurementMode,
    ) -> Self {
        Self {
            registry,
            bus,
            emitter,
            log_dir,
            mode,
            slot: SessionSlot::new(),
            active: Mutex::new(None),
            latest: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn state(&self) -> StreamingState {
        match self.active.lock().as_ref() {
            Some(active) => StreamingState::Active {
                participants: active.participants.clone(),
                started_at: active.started_at,
            },
            None => StreamingState::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot.is_busy()
    }

    pub fn latest_sample(&self, address: &str) -> Option<SensorSample> {
        self.latest.read().get(address).cloned()
    }

    /// Open one log per participant and begin measurement on all of them
    ///
    /// Every participant must be connected. Whether the participants were
    /// synchronized first is the caller's concern.
    pub async fn start(&self, participants: &[String]) -> StreamingResult<StreamingStarted> {
        let guard = self.slot.try_acquire().ok_or(StreamingError::AlreadyActive)?;
        if participants.is_empty() {
            return Err(StreamingError::NoParticipants);
        }
        let not_connected = self.registry.not_connected(participants);
        if !not_connected.is_empty() {
            return Err(StreamingError::PreconditionFailed { not_connected });
        }

        let sinks = self.open_sinks(participants)?;
        let log_files: BTreeMap<String, PathBuf> = sinks
            .iter()
            .map(|(address, sink)| (address.clone(), sink.path().to_path_buf()))
            .collect();

        self.latest.write().clear();
        let cancel = CancellationToken::new();
        let router = tokio::spawn(route_samples(
            self.bus.subscribe(),
            sinks,
            Arc::clone(&self.latest),
            cancel.clone(),
        ));

        self.registry.set_measurement_mode(participants, self.mode);
        let handles: Vec<_> = participants
            .iter()
            .filter_map(|a| self.registry.get(a))
            .collect();
        let mode = self.mode;
        let results = join_all(handles.iter().map(|h| h.device().start_measuring(mode))).await;
        let mut failed = Vec::new();
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("Device {} did not start measuring: {}", handle.address(), e);
                failed.push(handle.address().to_string());
            }
        }

        tracing::info!("Streaming started on {} devices", participants.len());
        self.emitter.emit(CoordinatorEvent::StreamingStarted {
            participants: participants.to_vec(),
            log_files: log_files.values().cloned().collect(),
        });

        *self.active.lock() = Some(ActiveStream {
            participants: participants.to_vec(),
            started_at: Utc::now(),
            log_files: log_files.clone(),
            cancel,
            router,
            _guard: guard,
        });

        Ok(StreamingStarted { log_files, failed })
    }

    /// End measurement and close every log; `None` if nothing was active
    pub async fn stop(&self) -> Option<StreamingSummary> {
        let active = self.active.lock().take()?;

        let handles: Vec<_> = active
            .participants
            .iter()
            .filter_map(|a| self.registry.get(a))
            .collect();
        let results = join_all(handles.iter().map(|h| h.device().stop_measuring())).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("Device {} did not stop measuring: {}", handle.address(), e);
            }
        }

        active.cancel.cancel();
        let samples_written = match active.router.await {
            Ok(written) => written,
            Err(e) => {
                tracing::error!("Sample router task failed: {}", e);
                BTreeMap::new()
            }
        };

        tracing::info!("Streaming stopped, samples written: {:?}", samples_written);
        self.emitter.emit(CoordinatorEvent::StreamingStopped {
            participants: active.participants.clone(),
            samples_written: samples_written.clone(),
        });

        Some(StreamingSummary {
            participants: active.participants,
            log_files: active.log_files,
            samples_written,
        })
    }

    fn open_sinks(&self, participants: &[String]) -> StreamingResult<HashMap<String, Box<dyn SampleSink>>> {
        let mut sinks: HashMap<String, Box<dyn SampleSink>> = HashMap::new();
        let mut used: HashSet<String> = HashSet::new();

        for address in participants {
            let Some(handle) = self.registry.get(address) else {
                continue;
            };
            let mut base = sanitize_label(&handle.label());
            if base.is_empty() {
                base = sanitize_label(address);
            }
            let label = unique_label(&base, &mut used);

            let header = LogHeader {
                label: label.clone(),
                address: address.clone(),
                is_synced: handle.status().is_synced,
                measurement_mode: self.mode,
            };
            match CsvSampleLogger::create(&self.log_dir, &header) {
                Ok(logger) => {
                    sinks.insert(address.clone(), Box::new(logger));
                }
                Err(source) => {
                    close_all(sinks);
                    return Err(StreamingError::SinkCreateFailed { label, source });
                }
            }
        }
        Ok(sinks)
    }
}

/// `base`, or `base_N` with the smallest N >= 2 not taken yet
fn unique_label(base: &str, used: &mut HashSet<String>) -> String {
    let mut label = base.to_string();
    let mut n = 2;
    while used.contains(&label) {
        label = format!("{}_{}", base, n);
        n += 1;
    }
    used.insert(label.clone());
    label
}

fn close_all(sinks: HashMap<String, Box<dyn SampleSink>>) -> BTreeMap<String, u64> {
    let mut written = BTreeMap::new();
    for (address, sink) in sinks {
        match sink.close() {
            Ok(count) => {
                written.insert(address, count);
            }
            Err(e) => tracing::warn!("Failed to close log for {}: {}", address, e),
        }
    }
    written
}

fn route(
    event: DeviceEvent,
    sinks: &mut HashMap<String, Box<dyn SampleSink>>,
    latest: &RwLock<HashMap<String, SensorSample>>,
) {
    if let DeviceEventKind::Telemetry(sample) = event.kind {
        if let Some(sink) = sinks.get_mut(&event.address) {
            if let Err(e) = sink.write(&sample) {
                tracing::warn!("Failed to log sample from {}: {}", event.address, e);
            }
            latest.write().insert(event.address, sample);
        }
    }
}

/// Owns the sinks for the lifetime of one session
///
/// On cancel, packets already queued on the bus are still written before
/// the sinks are closed.
async fn route_samples(
    mut events: DeviceEventStream,
    mut sinks: HashMap<String, Box<dyn SampleSink>>,
    latest: Arc<RwLock<HashMap<String, SensorSample>>>,
    cancel: CancellationToken,
) -> BTreeMap<String, u64> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                while let Some(event) = events.try_recv() {
                    route(event, &mut sinks, &latest);
                }
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                route(event, &mut sinks, &latest);
            }
        }
    }
    close_all(sinks)
}
