//! Simulated sensor transport
//!
//! Scripted stand-in for a physical sensor. Every command is recorded,
//! may be rejected according to the configured behavior, and answers with
//! the same asynchronous events a real transport would publish.

use super::events::{DeviceEvent, DeviceEventBus, DeviceEventKind};
use super::traits::{
    ConnectionState, Device, DeviceError, DeviceResult, ExportField, MeasurementMode, MfmQuality,
    RecordingAckState, RecordingCommand, RecordingFileInfo, SensorSample,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Commands a simulated device can be scripted to reject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimCommand {
    Connect,
    Disconnect,
    StartMeasuring,
    StopMeasuring,
    StartSyncing,
    StopSyncing,
    EnableNotification,
    RequestFlashInfo,
    StartRecording,
    StopRecording,
    RequestRecordingState,
    RequestFileInfo,
    SelectExportedData,
    StartExporting,
    StopExporting,
    StartMfm,
    StopMfm,
    WriteMfmResult,
}

/// How a sync request ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Succeed,
    Fail,
    /// Drop the link halfway through
    Disconnect,
    /// Never report a result
    Silent,
}

#[derive(Debug, Clone)]
pub struct SimulatedBehavior {
    /// Delay before each asynchronous answer
    pub latency: Duration,
    pub sync: SyncOutcome,
    pub notification_enabled: bool,
    pub flash_used: u64,
    pub flash_total: u64,
    /// Files in flash, oldest first
    pub files: Vec<RecordingFileInfo>,
    /// Telemetry packets emitted after each start-measuring
    pub samples_per_start: u32,
    /// Report completion after exporting every file
    pub export_completes: bool,
    /// Mapping progress reported after start-mfm
    pub mfm_progress: Vec<u8>,
    /// Result reported on stop-mfm after full progress; `None` never reports
    pub mfm_quality: Option<MfmQuality>,
    /// Reject the first N calls of a command
    pub reject_first: HashMap<SimCommand, u32>,
    /// Reject every call of a command
    pub reject_always: HashSet<SimCommand>,
}

impl Default for SimulatedBehavior {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(2),
            sync: SyncOutcome::Succeed,
            notification_enabled: true,
            flash_used: 10,
            flash_total: 100,
            files: Vec::new(),
            samples_per_start: 0,
            export_completes: true,
            mfm_progress: vec![50, 100],
            mfm_quality: Some(MfmQuality::Good),
            reject_first: HashMap::new(),
            reject_always: HashSet::new(),
        }
    }
}

pub struct SimulatedDevice {
    address: String,
    name: String,
    bus: DeviceEventBus,
    behavior: Mutex<SimulatedBehavior>,
    calls: Mutex<Vec<SimCommand>>,
}

impl SimulatedDevice {
    pub fn new(address: impl Into<String>, name: impl Into<String>, bus: DeviceEventBus) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            bus,
            behavior: Mutex::new(SimulatedBehavior::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Build a flash file entry for this device
    pub fn file(&self, file_id: u32, file_name: &str, size_bytes: u64, start_timestamp: i64) -> RecordingFileInfo {
        RecordingFileInfo {
            address: self.address.clone(),
            file_id,
            file_name: file_name.to_string(),
            size_bytes,
            start_timestamp,
        }
    }

    pub fn set_behavior<F>(&self, f: F)
    where
        F: FnOnce(&mut SimulatedBehavior),
    {
        f(&mut self.behavior.lock());
    }

    pub fn call_count(&self, command: SimCommand) -> usize {
        self.calls.lock().iter().filter(|c| **c == command).count()
    }

    /// Publish an event as if the transport had produced it
    pub fn emit(&self, kind: DeviceEventKind) {
        self.bus.publish(DeviceEvent::new(self.address.clone(), kind));
    }

    fn accept(&self, command: SimCommand) -> DeviceResult<()> {
        self.calls.lock().push(command);
        let mut behavior = self.behavior.lock();
        let rejected = if behavior.reject_always.contains(&command) {
            true
        } else if let Some(left) = behavior.reject_first.get_mut(&command) {
            if *left > 0 {
                *left -= 1;
                true
            } else {
                false
            }
        } else {
            false
        };
        if rejected {
            return Err(DeviceError::Rejected {
                address: self.address.clone(),
                command: format!("{command:?}"),
            });
        }
        Ok(())
    }

    fn latency(&self) -> Duration {
        self.behavior.lock().latency
    }

    /// Publish `events` one latency step apart
    fn answer(&self, events: Vec<DeviceEventKind>) {
        let bus = self.bus.clone();
        let address = self.address.clone();
        let latency = self.latency();
        tokio::spawn(async move {
            for kind in events {
                tokio::time::sleep(latency).await;
                bus.publish(DeviceEvent::new(address.clone(), kind));
            }
        });
    }

    fn sample(counter: u32) -> SensorSample {
        let t = counter as f64;
        SensorSample {
            packet_counter: counter,
            sample_time_fine: 16_667 * counter as u64,
            euler: Some([t * 0.1, -t * 0.2, t * 0.3]),
            quaternion: None,
            free_acc: Some([0.01, -0.02, 0.03]),
            acc: None,
            gyr: None,
        }
    }
}

#[async_trait]
impl Device for SimulatedDevice {
    fn address(&self) -> &str {
        &self.address
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> DeviceResult<()> {
        self.accept(SimCommand::Connect)?;
        self.answer(vec![
            DeviceEventKind::ConnectionChanged(ConnectionState::Connecting),
            DeviceEventKind::ConnectionChanged(ConnectionState::Connected),
        ]);
        Ok(())
    }

    async fn disconnect(&self) -> DeviceResult<()> {
        self.accept(SimCommand::Disconnect)?;
        self.answer(vec![DeviceEventKind::ConnectionChanged(
            ConnectionState::Disconnected,
        )]);
        Ok(())
    }

    async fn start_measuring(&self, _mode: MeasurementMode) -> DeviceResult<()> {
        self.accept(SimCommand::StartMeasuring)?;
        let count = self.behavior.lock().samples_per_start;
        self.answer(
            (1..=count)
                .map(|i| DeviceEventKind::Telemetry(Self::sample(i)))
                .collect(),
        );
        Ok(())
    }

    async fn stop_measuring(&self) -> DeviceResult<()> {
        self.accept(SimCommand::StopMeasuring)
    }

    async fn start_syncing(&self, _root_address: &str) -> DeviceResult<()> {
        self.accept(SimCommand::StartSyncing)?;
        let outcome = self.behavior.lock().sync;
        let mut events = vec![DeviceEventKind::SyncProgress(50)];
        match outcome {
            SyncOutcome::Succeed => events.push(DeviceEventKind::SyncResult { success: true }),
            SyncOutcome::Fail => events.push(DeviceEventKind::SyncResult { success: false }),
            SyncOutcome::Disconnect => events.push(DeviceEventKind::ConnectionChanged(
                ConnectionState::Disconnected,
            )),
            SyncOutcome::Silent => {}
        }
        self.answer(events);
        Ok(())
    }

    async fn stop_syncing(&self) -> DeviceResult<()> {
        self.accept(SimCommand::StopSyncing)
    }

    async fn enable_recording_notification(&self) -> DeviceResult<()> {
        self.accept(SimCommand::EnableNotification)?;
        let enabled = self.behavior.lock().notification_enabled;
        self.answer(vec![DeviceEventKind::RecordingNotification { enabled }]);
        Ok(())
    }

    async fn request_flash_info(&self) -> DeviceResult<()> {
        self.accept(SimCommand::RequestFlashInfo)?;
        let (used_bytes, total_bytes) = {
            let behavior = self.behavior.lock();
            (behavior.flash_used, behavior.flash_total)
        };
        self.answer(vec![DeviceEventKind::FlashInfo {
            used_bytes,
            total_bytes,
        }]);
        Ok(())
    }

    async fn start_recording(&self) -> DeviceResult<()> {
        self.accept(SimCommand::StartRecording)?;
        self.answer(vec![DeviceEventKind::RecordingAck {
            command: RecordingCommand::StartRecording,
            state: RecordingAckState::Success,
        }]);
        Ok(())
    }

    async fn stop_recording(&self) -> DeviceResult<()> {
        self.accept(SimCommand::StopRecording)?;
        self.answer(vec![DeviceEventKind::RecordingAck {
            command: RecordingCommand::StopRecording,
            state: RecordingAckState::Success,
        }]);
        Ok(())
    }

    async fn request_recording_state(&self) -> DeviceResult<()> {
        self.accept(SimCommand::RequestRecordingState)?;
        // Recording is on when the last start was not followed by a stop
        let recording = {
            let calls = self.calls.lock();
            calls
                .iter()
                .rev()
                .find(|c| matches!(c, SimCommand::StartRecording | SimCommand::StopRecording))
                .map(|c| *c == SimCommand::StartRecording)
                .unwrap_or(false)
        };
        let state = if recording {
            RecordingAckState::Recording
        } else {
            RecordingAckState::Idle
        };
        self.answer(vec![DeviceEventKind::RecordingAck {
            command: RecordingCommand::GetState,
            state,
        }]);
        Ok(())
    }

    async fn request_file_info(&self) -> DeviceResult<()> {
        self.accept(SimCommand::RequestFileInfo)?;
        let files = self.behavior.lock().files.clone();
        self.answer(vec![DeviceEventKind::FileInfo {
            files,
            success: true,
        }]);
        Ok(())
    }

    async fn select_exported_data(&self, _fields: &[ExportField]) -> DeviceResult<()> {
        self.accept(SimCommand::SelectExportedData)
    }

    async fn start_exporting(
        &self,
        files: &[RecordingFileInfo],
        output_dir: &Path,
    ) -> DeviceResult<()> {
        self.accept(SimCommand::StartExporting)?;
        for file in files {
            let path = output_dir.join(format!(
                "{}_{}.csv",
                self.address.replace(':', ""),
                file.file_name
            ));
            std::fs::write(&path, format!("file_id,{}\n", file.file_id))
                .map_err(|e| DeviceError::Transport(e.to_string()))?;
        }
        let mut events: Vec<DeviceEventKind> = files
            .iter()
            .cloned()
            .map(DeviceEventKind::FileExported)
            .collect();
        if self.behavior.lock().export_completes {
            events.push(DeviceEventKind::AllDataExported);
        }
        self.answer(events);
        Ok(())
    }

    async fn stop_exporting(&self) -> DeviceResult<()> {
        self.accept(SimCommand::StopExporting)?;
        self.answer(vec![DeviceEventKind::ExportStopped]);
        Ok(())
    }

    async fn start_mfm(&self) -> DeviceResult<()> {
        self.accept(SimCommand::StartMfm)?;
        let progress = self.behavior.lock().mfm_progress.clone();
        self.answer(progress.into_iter().map(DeviceEventKind::MfmProgress).collect());
        Ok(())
    }

    async fn stop_mfm(&self) -> DeviceResult<()> {
        self.accept(SimCommand::StopMfm)?;
        let (complete, quality) = {
            let behavior = self.behavior.lock();
            (behavior.mfm_progress.last() == Some(&100), behavior.mfm_quality)
        };
        if let (true, Some(quality)) = (complete, quality) {
            let parameters = quality.is_usable().then(|| self.address.as_bytes().to_vec());
            self.answer(vec![DeviceEventKind::MfmCompleted { quality, parameters }]);
        }
        Ok(())
    }

    async fn write_mfm_result(&self, _parameters: &[u8]) -> DeviceResult<()> {
        self.accept(SimCommand::WriteMfmResult)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reject_first_then_accept() {
        let bus = DeviceEventBus::new(16);
        let device = SimulatedDevice::new("A", "DOT", bus);
        device.set_behavior(|b| {
            b.reject_first.insert(SimCommand::StartRecording, 1);
        });

        assert!(device.start_recording().await.is_err());
        assert!(device.start_recording().await.is_ok());
        assert_eq!(device.call_count(SimCommand::StartRecording), 2);
    }

    #[tokio::test]
    async fn test_flash_info_is_published() {
        let bus = DeviceEventBus::new(16);
        let mut events = bus.subscribe();
        let device = SimulatedDevice::new("A", "DOT", bus);
        device.set_behavior(|b| {
            b.flash_used = 95;
            b.flash_total = 100;
        });

        device.request_flash_info().await.unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            DeviceEventKind::FlashInfo {
                used_bytes: 95,
                total_bytes: 100
            }
        ));
    }
}
