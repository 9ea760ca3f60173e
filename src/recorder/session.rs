//! Recording session
//!
//! Prepares a participant set for on-device recording, then starts and
//! stops recording on all of them and reconciles their reported state.

use super::flow::RecordingFlow;
use super::state::{
    RecordingData, RecordingError, RecordingPhase, RecordingReadiness, RecordingReport,
    RecordingResult,
};
use crate::config::CoordinatorConfig;
use crate::device::{DeviceEventBus, DeviceRegistry, RecordingCommand, RecordingFileInfo};
use crate::events::EventEmitter;
use crate::session::CommandPacer;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct RecordingSession {
    registry: Arc<DeviceRegistry>,
    bus: DeviceEventBus,
    emitter: EventEmitter,
    pacer: CommandPacer,
    barrier_timeout: Duration,
    ack_timeout: Duration,
    storage_threshold: u8,

    /// Operations run one at a time against the current flow
    flow: Mutex<Option<RecordingFlow>>,

    phase: RwLock<RecordingPhase>,
    readiness: RwLock<Option<RecordingReadiness>>,

    /// Copy of the flow's records, readable while an operation runs
    records: RwLock<Vec<RecordingData>>,
}

impl RecordingSession {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        bus: DeviceEventBus,
        emitter: EventEmitter,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            emitter,
            pacer: CommandPacer::new(config.command_pacing(), config.retry_delay()),
            barrier_timeout: config.barrier_timeout(),
            ack_timeout: config.ack_timeout(),
            storage_threshold: config.storage_threshold_percent,
            flow: Mutex::new(None),
            phase: RwLock::new(RecordingPhase::Idle),
            readiness: RwLock::new(None),
            records: RwLock::new(Vec::new()),
        }
    }

    pub fn phase(&self) -> RecordingPhase {
        *self.phase.read()
    }

    /// Prepared and every participant can record
    pub fn is_ready(&self) -> bool {
        self.readiness
            .read()
            .as_ref()
            .map(|r| r.all_can_record())
            .unwrap_or(false)
    }

    pub fn records(&self) -> Vec<RecordingData> {
        self.records.read().clone()
    }

    fn publish(&self, flow: &RecordingFlow) {
        *self.records.write() = flow.records().to_vec();
        *self.phase.write() = if flow.is_any_recording() {
            RecordingPhase::Recording
        } else if flow.is_ready() {
            RecordingPhase::Ready
        } else {
            RecordingPhase::Idle
        };
    }

    /// Enable notifications and read flash info on every participant
    ///
    /// Replaces any earlier preparation. Completes once every participant
    /// has answered, or fails with [`RecordingError::Timeout`].
    pub async fn prepare(&self, participants: &[String]) -> RecordingResult<RecordingReadiness> {
        if participants.is_empty() {
            return Err(RecordingError::NoParticipants);
        }
        let not_connected = self.registry.not_connected(participants);
        if !not_connected.is_empty() {
            return Err(RecordingError::PreconditionFailed { not_connected });
        }

        let mut current = self.flow.lock().await;
        if current.as_ref().map(|f| f.is_any_recording()).unwrap_or(false) {
            return Err(RecordingError::AlreadyRecording);
        }

        *self.phase.write() = RecordingPhase::Preparing;
        *self.readiness.write() = None;
        let mut events = self.bus.subscribe();
        let mut flow = RecordingFlow::new(
            Arc::clone(&self.registry),
            self.emitter.clone(),
            self.pacer,
            self.storage_threshold,
            participants,
        );
        let result = flow.prepare(&mut events, self.barrier_timeout).await;

        self.publish(&flow);
        *current = Some(flow);
        if let Ok(readiness) = &result {
            *self.readiness.write() = Some(readiness.clone());
        }
        result
    }

    /// Start recording on every participant
    ///
    /// Refused unless preparation completed and every participant can
    /// record. Each device gets one retry; devices that still refuse are
    /// reported and left out.
    pub async fn start_recording(&self) -> RecordingResult<RecordingReport> {
        let mut current = self.flow.lock().await;
        let flow = current.as_mut().ok_or(RecordingError::NotPrepared)?;
        if !flow.is_ready() {
            return Err(RecordingError::NotPrepared);
        }
        if flow.is_any_recording() {
            return Err(RecordingError::AlreadyRecording);
        }
        let readiness = flow.readiness();
        if !readiness.all_can_record() {
            return Err(RecordingError::NotReady {
                blocked: readiness.blocked(),
            });
        }

        let participants = flow.participants();
        let mut events = self.bus.subscribe();
        let mut report = flow
            .send_to_all(RecordingCommand::StartRecording, &participants, true)
            .await;
        report.unacknowledged = flow
            .await_acks(
                &mut events,
                RecordingCommand::StartRecording,
                &report.accepted,
                self.ack_timeout,
            )
            .await;

        tracing::info!(
            "Recording started on {:?}, failed: {:?}",
            flow.recording_devices(),
            report.failed_addresses()
        );
        self.publish(flow);
        Ok(report)
    }

    /// Stop recording on every participant
    ///
    /// Single attempt per device; failures are reported but never abort the
    /// stop for the others. Nothing to do when nothing was prepared.
    pub async fn stop_recording(&self) -> RecordingReport {
        let mut current = self.flow.lock().await;
        let Some(flow) = current.as_mut() else {
            return RecordingReport::default();
        };

        let participants = flow.participants();
        let mut events = self.bus.subscribe();
        let mut report = flow
            .send_to_all(RecordingCommand::StopRecording, &participants, false)
            .await;
        report.unacknowledged = flow
            .await_acks(
                &mut events,
                RecordingCommand::StopRecording,
                &report.accepted,
                self.ack_timeout,
            )
            .await;

        tracing::info!("Recording stopped, still recording: {:?}", flow.recording_devices());
        self.publish(flow);
        report
    }

    /// File lists of every notification-enabled participant, most recent first
    pub async fn request_file_info(&self) -> RecordingResult<BTreeMap<String, Vec<RecordingFileInfo>>> {
        let mut current = self.flow.lock().await;
        let flow = current.as_mut().ok_or(RecordingError::NotPrepared)?;
        if flow.is_any_recording() {
            return Err(RecordingError::AlreadyRecording);
        }

        let mut events = self.bus.subscribe();
        let lists = flow.request_file_info(&mut events, self.barrier_timeout).await;
        self.publish(flow);
        Ok(lists)
    }

    /// Ask every participant whether it is recording
    ///
    /// Devices that do not answer keep their last known state.
    pub async fn query_recording_state(&self) -> RecordingResult<BTreeMap<String, bool>> {
        let mut current = self.flow.lock().await;
        let flow = current.as_mut().ok_or(RecordingError::NotPrepared)?;

        let participants = flow.participants();
        let mut events = self.bus.subscribe();
        let mut report = flow
            .send_to_all(RecordingCommand::GetState, &participants, false)
            .await;
        report.unacknowledged = flow
            .await_acks(
                &mut events,
                RecordingCommand::GetState,
                &report.accepted,
                self.ack_timeout,
            )
            .await;
        if !report.is_complete_success() {
            tracing::debug!(
                "Recording state unknown for {:?} {:?}",
                report.failed_addresses(),
                report.unacknowledged
            );
        }

        self.publish(flow);
        Ok(flow
            .records()
            .iter()
            .map(|r| (r.address.clone(), r.is_recording))
            .collect())
    }
}
