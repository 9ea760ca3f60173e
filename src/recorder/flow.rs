//! Recording flow
//!
//! The device-side steps shared by recording and export: enable the
//! recording notification, read flash info, list recorded files, and fold
//! recording acknowledgments into per-device state. A flow owns the
//! [`RecordingData`] of one participant set and is driven by the caller,
//! which passes in its own event stream.

use super::state::{
    can_record_from_flash, RecordingData, RecordingError, RecordingFlowState, RecordingReadiness,
    RecordingResult,
};
use crate::device::{
    ConnectionState, Device, DeviceEvent, DeviceEventKind, DeviceEventStream, DeviceRegistry,
    DeviceResult, Next, RecordingAckState, RecordingCommand, RecordingFileInfo,
};
use crate::events::{CoordinatorEvent, EventEmitter};
use crate::session::{
    Arrival, CommandOutcome, CommandPacer, CommandReport, DeviceFailure, FailureReason,
    ResponseBarrier,
};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn command_name(command: RecordingCommand) -> &'static str {
    match command {
        RecordingCommand::StartRecording => "start recording",
        RecordingCommand::StopRecording => "stop recording",
        RecordingCommand::GetState => "get recording state",
    }
}

async fn issue(device: &dyn Device, command: RecordingCommand) -> DeviceResult<()> {
    match command {
        RecordingCommand::StartRecording => device.start_recording().await,
        RecordingCommand::StopRecording => device.stop_recording().await,
        RecordingCommand::GetState => device.request_recording_state().await,
    }
}

pub struct RecordingFlow {
    registry: Arc<DeviceRegistry>,
    emitter: EventEmitter,
    pacer: CommandPacer,
    storage_threshold: u8,
    /// In participant order
    records: Vec<RecordingData>,
    /// Flash info arrived from every participant
    ready: bool,
}

impl RecordingFlow {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        emitter: EventEmitter,
        pacer: CommandPacer,
        storage_threshold: u8,
        participants: &[String],
    ) -> Self {
        let mut records: Vec<RecordingData> = Vec::with_capacity(participants.len());
        for address in participants {
            if !records.iter().any(|r| &r.address == address) {
                records.push(RecordingData::new(address.clone()));
            }
        }
        Self {
            registry,
            emitter,
            pacer,
            storage_threshold,
            records,
            ready: false,
        }
    }

    pub fn participants(&self) -> Vec<String> {
        self.records.iter().map(|r| r.address.clone()).collect()
    }

    pub fn records(&self) -> &[RecordingData] {
        &self.records
    }

    pub fn record(&self, address: &str) -> Option<&RecordingData> {
        self.records.iter().find(|r| r.address == address)
    }

    fn record_mut(&mut self, address: &str) -> Option<&mut RecordingData> {
        self.records.iter_mut().find(|r| r.address == address)
    }

    fn set_flow(&mut self, address: &str, flow: RecordingFlowState) {
        if let Some(record) = self.record_mut(address) {
            record.flow = flow;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn readiness(&self) -> RecordingReadiness {
        RecordingReadiness {
            can_record: self
                .records
                .iter()
                .map(|r| (r.address.clone(), r.can_record))
                .collect(),
        }
    }

    pub fn is_any_recording(&self) -> bool {
        self.records.iter().any(|r| r.is_recording)
    }

    /// Devices currently marked as recording
    pub fn recording_devices(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.is_recording)
            .map(|r| r.address.clone())
            .collect()
    }

    pub fn file_lists(&self) -> BTreeMap<String, Vec<RecordingFileInfo>> {
        self.records
            .iter()
            .map(|r| (r.address.clone(), r.file_info_list.clone()))
            .collect()
    }

    /// Enable notifications and collect flash info from every participant
    ///
    /// A participant that refuses the notification, rejects a command or
    /// disconnects counts as answered with `can_record = false`, so the
    /// wait ends as soon as every participant is accounted for.
    pub async fn prepare(
        &mut self,
        events: &mut DeviceEventStream,
        timeout: Duration,
    ) -> RecordingResult<RecordingReadiness> {
        self.ready = false;
        let participants = self.participants();
        let mut barrier = ResponseBarrier::new(participants.iter().cloned());
        let mut opened = participants.is_empty();

        for address in &participants {
            let Some(handle) = self.registry.get(address) else {
                opened |= self.settle(&mut barrier, address, false);
                continue;
            };
            self.set_flow(address, RecordingFlowState::NotificationRequested);
            let device = handle.device();
            let result = self
                .pacer
                .send("enable recording notification", address, || {
                    device.enable_recording_notification()
                })
                .await;
            if result.is_err() {
                opened |= self.settle(&mut barrier, address, false);
            }
        }

        let deadline = Instant::now() + timeout;
        while !opened {
            match events.recv_until(deadline).await {
                Next::Event(event) => opened = self.on_prepare_event(&mut barrier, event).await,
                Next::TimedOut | Next::Closed => {
                    let missing = barrier.missing();
                    tracing::warn!("Flash info never arrived from {:?}", missing);
                    return Err(RecordingError::Timeout { missing });
                }
            }
        }

        self.ready = true;
        let readiness = self.readiness();
        tracing::info!("Recording prepared: {:?}", readiness.can_record);
        self.emitter.emit(CoordinatorEvent::RecordingReady {
            can_record: readiness.can_record.clone(),
            ready: readiness.all_can_record(),
        });
        Ok(readiness)
    }

    async fn on_prepare_event(&mut self, barrier: &mut ResponseBarrier, event: DeviceEvent) -> bool {
        let DeviceEvent { address, kind } = event;
        if self.record(&address).is_none() {
            return false;
        }
        match kind {
            DeviceEventKind::RecordingNotification { enabled } => {
                if let Some(record) = self.record_mut(&address) {
                    record.notification_enabled = enabled;
                    record.flow = if enabled {
                        RecordingFlowState::NotificationEnabled
                    } else {
                        RecordingFlowState::NotificationDisabled
                    };
                }
                if let Some(handle) = self.registry.get(&address) {
                    handle.update(|s| s.notification_enabled = enabled);
                }
                if !enabled {
                    tracing::warn!("Recording notification refused by {}", address);
                    return self.settle(barrier, &address, false);
                }

                let Some(handle) = self.registry.get(&address) else {
                    return self.settle(barrier, &address, false);
                };
                self.set_flow(&address, RecordingFlowState::FlashInfoRequested);
                let device = handle.device();
                let result = self
                    .pacer
                    .send("request flash info", &address, || device.request_flash_info())
                    .await;
                if result.is_err() {
                    return self.settle(barrier, &address, false);
                }
                false
            }
            DeviceEventKind::FlashInfo {
                used_bytes,
                total_bytes,
            } => {
                let can_record = can_record_from_flash(used_bytes, total_bytes, self.storage_threshold);
                tracing::debug!(
                    "Flash info from {}: {}/{} bytes used, can record: {}",
                    address,
                    used_bytes,
                    total_bytes,
                    can_record
                );
                self.set_flow(&address, RecordingFlowState::FlashInfoReceived);
                self.settle(barrier, &address, can_record)
            }
            DeviceEventKind::ConnectionChanged(ConnectionState::Disconnected) => {
                tracing::warn!("{} disconnected while preparing to record", address);
                self.settle(barrier, &address, false)
            }
            _ => false,
        }
    }

    /// Count a participant as answered; true when this opened the barrier
    fn settle(&mut self, barrier: &mut ResponseBarrier, address: &str, can_record: bool) -> bool {
        let arrival = barrier.arrive(address);
        if arrival == Arrival::Ignored {
            return false;
        }
        if let Some(record) = self.record_mut(address) {
            record.can_record = can_record;
            let answered = matches!(
                record.flow,
                RecordingFlowState::NotificationDisabled | RecordingFlowState::FlashInfoReceived
            );
            if !answered {
                record.flow = RecordingFlowState::Unavailable;
            }
        }
        if let Some(handle) = self.registry.get(address) {
            handle.update(|s| s.can_record = can_record);
        }
        arrival == Arrival::Opened
    }

    /// Send one recording command to `addresses` concurrently
    pub async fn send_to_all(
        &self,
        command: RecordingCommand,
        addresses: &[String],
        retry: bool,
    ) -> CommandReport {
        let pacer = self.pacer;
        let name = command_name(command);
        let sends = addresses.iter().map(|address| {
            let handle = self.registry.get(address);
            async move {
                let Some(handle) = handle else {
                    return (address.clone(), Err(FailureReason::NotRegistered));
                };
                let device: &dyn Device = handle.device().as_ref();
                let result = if retry {
                    match pacer
                        .send_with_retry(name, address, || issue(device, command))
                        .await
                    {
                        CommandOutcome::Failed(e) => Err(FailureReason::CommandFailedAfterRetry {
                            message: e.to_string(),
                        }),
                        _ => Ok(()),
                    }
                } else {
                    pacer
                        .send(name, address, || issue(device, command))
                        .await
                        .map_err(|e| FailureReason::CommandFailed {
                            message: e.to_string(),
                        })
                };
                (address.clone(), result)
            }
        });

        let mut report = CommandReport::default();
        for (address, result) in join_all(sends).await {
            match result {
                Ok(()) => report.accepted.push(address),
                Err(reason) => report.failed.push(DeviceFailure::new(address, reason)),
            }
        }
        report
    }

    /// Wait for `command` to be acknowledged by every address in `expected`
    ///
    /// Returns the addresses that never acknowledged, including devices that
    /// disconnected while waiting. Their recording state is left as is.
    pub async fn await_acks(
        &mut self,
        events: &mut DeviceEventStream,
        command: RecordingCommand,
        expected: &[String],
        timeout: Duration,
    ) -> Vec<String> {
        if expected.is_empty() {
            return Vec::new();
        }
        let mut barrier = ResponseBarrier::new(expected.iter().cloned());
        let mut dropped = Vec::new();
        let deadline = Instant::now() + timeout;

        loop {
            let event = match events.recv_until(deadline).await {
                Next::Event(event) => event,
                Next::TimedOut | Next::Closed => {
                    let mut missing = barrier.missing();
                    tracing::warn!("No {} acknowledgment from {:?}", command_name(command), missing);
                    missing.extend(dropped);
                    return missing;
                }
            };
            let arrival = match event.kind {
                DeviceEventKind::RecordingAck {
                    command: acked,
                    state,
                } if acked == command => {
                    let arrival = barrier.arrive(&event.address);
                    if arrival != Arrival::Ignored {
                        self.apply_ack(&event.address, command, state);
                    }
                    arrival
                }
                DeviceEventKind::ConnectionChanged(ConnectionState::Disconnected) => {
                    let arrival = barrier.arrive(&event.address);
                    if arrival != Arrival::Ignored {
                        dropped.push(event.address);
                    }
                    arrival
                }
                _ => Arrival::Ignored,
            };
            if arrival == Arrival::Opened {
                return dropped;
            }
        }
    }

    fn apply_ack(&mut self, address: &str, command: RecordingCommand, state: RecordingAckState) {
        let Some(record) = self.record_mut(address) else {
            return;
        };
        let is_recording = match command {
            RecordingCommand::StartRecording => {
                if !record.can_record {
                    tracing::warn!("Ignoring start acknowledgment from blocked device {}", address);
                    return;
                }
                state == RecordingAckState::Success
            }
            RecordingCommand::StopRecording => {
                if state == RecordingAckState::Success {
                    false
                } else {
                    record.is_recording
                }
            }
            RecordingCommand::GetState => state == RecordingAckState::Recording,
        };
        tracing::debug!("{} acknowledged {:?}: {:?}", address, command, state);

        record.is_recording = is_recording;
        record.flow = if is_recording {
            RecordingFlowState::Recording
        } else {
            RecordingFlowState::NotRecording
        };
        if let Some(handle) = self.registry.get(address) {
            handle.update(|s| s.is_recording = is_recording);
        }
        self.emitter.emit(CoordinatorEvent::RecordingStateChanged {
            address: address.to_string(),
            is_recording,
        });
    }

    /// Ask every notification-enabled participant for its file list
    ///
    /// Lists are stored most recent first. Devices that do not answer within
    /// `timeout` keep an empty list.
    pub async fn request_file_info(
        &mut self,
        events: &mut DeviceEventStream,
        timeout: Duration,
    ) -> BTreeMap<String, Vec<RecordingFileInfo>> {
        let targets: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.notification_enabled)
            .map(|r| r.address.clone())
            .collect();

        let mut accepted = Vec::new();
        for address in &targets {
            if let Some(record) = self.record_mut(address) {
                record.file_info_list.clear();
            }
            let Some(handle) = self.registry.get(address) else {
                continue;
            };
            let device = handle.device();
            let result = self
                .pacer
                .send("request file info", address, || device.request_file_info())
                .await;
            if result.is_ok() {
                accepted.push(address.clone());
            }
        }

        let mut barrier = ResponseBarrier::new(accepted.iter().cloned());
        let mut opened = accepted.is_empty();
        let deadline = Instant::now() + timeout;
        while !opened {
            let event = match events.recv_until(deadline).await {
                Next::Event(event) => event,
                Next::TimedOut | Next::Closed => {
                    tracing::warn!("File info never arrived from {:?}", barrier.missing());
                    break;
                }
            };
            let address = event.address;
            let arrival = match event.kind {
                DeviceEventKind::FileInfo { files, success } => {
                    let arrival = barrier.arrive(&address);
                    if arrival != Arrival::Ignored {
                        self.store_files(&address, files, success);
                    }
                    arrival
                }
                DeviceEventKind::ConnectionChanged(ConnectionState::Disconnected) => {
                    barrier.arrive(&address)
                }
                _ => Arrival::Ignored,
            };
            opened = arrival == Arrival::Opened;
        }

        self.file_lists()
    }

    fn store_files(&mut self, address: &str, files: Vec<RecordingFileInfo>, success: bool) {
        if !success {
            tracing::warn!("{} failed to list its files", address);
            return;
        }
        let files: Vec<RecordingFileInfo> = files
            .into_iter()
            .rev()
            .map(|mut file| {
                file.address = address.to_string();
                file
            })
            .collect();
        tracing::debug!("{} reported {} files", address, files.len());
        if let Some(record) = self.record_mut(address) {
            record.file_info_list = files.clone();
        }
        self.emitter.emit(CoordinatorEvent::FileInfoReceived {
            address: address.to_string(),
            files,
        });
    }
}
