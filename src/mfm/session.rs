//! Magnetic field mapping session
//!
//! Starts mapping on every participant and follows each device through
//! data collection, processing and writing the result back. Devices move
//! through these steps independently; the run ends once every device is
//! done or the collection timeout passes.

use super::state::{outcome_of, MfmDevice, MfmError, MfmReport, MfmResult, MfmStatus};
use crate::config::CoordinatorConfig;
use crate::device::{
    ConnectionState, DeviceEvent, DeviceEventBus, DeviceEventKind, DeviceEventStream,
    DeviceRegistry, Next,
};
use crate::events::{CoordinatorEvent, EventEmitter};
use crate::session::{CommandPacer, SessionSlot};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct MfmSession {
    registry: Arc<DeviceRegistry>,
    bus: DeviceEventBus,
    emitter: EventEmitter,
    pacer: CommandPacer,
    timeout: Duration,
    slot: SessionSlot,

    /// Devices of the running or most recent run
    devices: RwLock<BTreeMap<String, MfmDevice>>,

    cancel: Mutex<Option<CancellationToken>>,
}

impl MfmSession {
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
            timeout: config.mfm_timeout(),
            slot: SessionSlot::new(),
            devices: RwLock::new(BTreeMap::new()),
            cancel: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_busy()
    }

    pub fn devices(&self) -> Vec<MfmDevice> {
        self.devices.read().values().cloned().collect()
    }

    pub fn device(&self, address: &str) -> Option<MfmDevice> {
        self.devices.read().get(address).cloned()
    }

    fn status(&self, address: &str) -> Option<MfmStatus> {
        self.devices.read().get(address).map(|d| d.status)
    }

    fn all_done(&self) -> bool {
        self.devices.read().values().all(|d| d.status.is_done())
    }

    fn addresses_where(&self, pred: impl Fn(MfmStatus) -> bool) -> Vec<String> {
        self.devices
            .read()
            .values()
            .filter(|d| pred(d.status))
            .map(|d| d.address.clone())
            .collect()
    }

    fn set_status(&self, address: &str, status: MfmStatus) {
        let changed = match self.devices.write().get_mut(address) {
            Some(device) if device.status != status => {
                device.status = status;
                true
            }
            _ => false,
        };
        if changed {
            tracing::debug!("Mapping on {} is now {:?}", address, status);
            self.emitter.emit(CoordinatorEvent::MfmStatusChanged {
                address: address.to_string(),
                status,
            });
        }
    }

    /// Map every participant and write usable results back
    ///
    /// Per-device failures never fail the call; they are reported in the
    /// returned report.
    pub async fn start_all(&self, participants: &[String]) -> MfmResult<MfmReport> {
        let _guard = self.slot.try_acquire().ok_or(MfmError::AlreadyRunning)?;
        if participants.is_empty() {
            return Err(MfmError::NoParticipants);
        }
        let not_connected = self.registry.not_connected(participants);
        if !not_connected.is_empty() {
            return Err(MfmError::PreconditionFailed { not_connected });
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());
        let mut events = self.bus.subscribe();

        *self.devices.write() = participants
            .iter()
            .map(|a| (a.clone(), MfmDevice::new(a.clone())))
            .collect();
        tracing::info!("Starting magnetic field mapping on {} devices", participants.len());
        self.emitter.emit(CoordinatorEvent::MfmStarted {
            participants: participants.to_vec(),
        });

        self.issue_start(participants).await;
        let (cancelled, timed_out) = self.await_results(&mut events, &token).await;
        *self.cancel.lock() = None;

        let devices = self.devices.read().clone();
        let report = MfmReport {
            outcome: outcome_of(&devices, cancelled, timed_out),
            devices,
        };
        tracing::info!(
            "Magnetic field mapping ended {:?}, finished {:?}",
            report.outcome,
            report.finished()
        );
        self.emitter.emit(CoordinatorEvent::MfmDone {
            outcome: report.outcome,
            finished: report.finished(),
            failed: report.failed(),
        });
        Ok(report)
    }

    /// Stop a run whose devices are all still collecting data
    ///
    /// Refused while any device is processing or writing its result.
    pub fn cancel(&self) -> MfmResult<()> {
        if !self.is_running() {
            return Err(MfmError::NotRunning);
        }
        let busy = self.addresses_where(|s| matches!(s, MfmStatus::Processing | MfmStatus::Writing));
        if !busy.is_empty() {
            return Err(MfmError::NotCancelable { busy });
        }
        if let Some(token) = self.cancel.lock().as_ref() {
            tracing::info!("Cancelling magnetic field mapping");
            token.cancel();
        }
        Ok(())
    }

    /// Write the stored result of `address` to the device again
    pub async fn rewrite(&self, address: &str) -> MfmResult<MfmDevice> {
        let no_result = || MfmError::NoResult {
            address: address.to_string(),
        };
        let (status, parameters) = {
            let devices = self.devices.read();
            let device = devices.get(address).ok_or_else(no_result)?;
            (device.status, device.parameters.clone())
        };
        let parameters = parameters.ok_or_else(no_result)?;
        if status == MfmStatus::Writing {
            return Err(MfmError::NotCancelable {
                busy: vec![address.to_string()],
            });
        }
        let not_connected = self.registry.not_connected(&[address.to_string()]);
        if !not_connected.is_empty() {
            return Err(MfmError::PreconditionFailed { not_connected });
        }

        tracing::info!("Rewriting mapping result to {}", address);
        self.write_back(address, &parameters).await?;
        self.device(address).ok_or_else(no_result)
    }

    async fn issue_start(&self, participants: &[String]) {
        let pacer = self.pacer;
        let sends = participants.iter().map(|address| {
            let handle = self.registry.get(address);
            async move {
                let Some(handle) = handle else {
                    return (address.clone(), false);
                };
                let device = handle.device();
                let started = pacer
                    .send("start mfm", address, || device.start_mfm())
                    .await
                    .is_ok();
                (address.clone(), started)
            }
        });
        for (address, started) in join_all(sends).await {
            let status = if started {
                MfmStatus::Started
            } else {
                MfmStatus::StartFailed
            };
            self.set_status(&address, status);
        }
    }

    /// Returns whether the run was cancelled and whether it timed out
    async fn await_results(
        &self,
        events: &mut DeviceEventStream,
        token: &CancellationToken,
    ) -> (bool, bool) {
        let deadline = Instant::now() + self.timeout;
        while !self.all_done() {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.end_pending(MfmStatus::Stopped).await;
                    return (true, false);
                }
                next = events.recv_until(deadline) => match next {
                    Next::Event(event) => self.on_event(event).await,
                    Next::TimedOut | Next::Closed => {
                        tracing::warn!(
                            "Magnetic field mapping timed out on {:?}",
                            self.addresses_where(|s| !s.is_done())
                        );
                        self.end_pending(MfmStatus::ProcessFailed).await;
                        return (false, true);
                    }
                },
            }
        }
        (false, false)
    }

    async fn on_event(&self, event: DeviceEvent) {
        let DeviceEvent { address, kind } = event;
        let Some(status) = self.status(&address) else {
            return;
        };
        if status.is_done() {
            return;
        }
        match kind {
            DeviceEventKind::MfmProgress(percent) if status.is_cancelable() => {
                let percent = percent.min(100);
                if let Some(device) = self.devices.write().get_mut(&address) {
                    device.percent = percent;
                }
                self.emitter.emit(CoordinatorEvent::MfmProgress {
                    address: address.clone(),
                    percent,
                });
                if percent == 100 {
                    self.set_status(&address, MfmStatus::Processing);
                    self.send_stop(&address).await;
                }
            }
            DeviceEventKind::MfmCompleted {
                quality,
                parameters,
            } => {
                if let Some(device) = self.devices.write().get_mut(&address) {
                    device.quality = Some(quality);
                    device.parameters = parameters.clone();
                }
                match parameters {
                    Some(parameters) if quality.is_usable() => {
                        if let Err(e) = self.write_back(&address, &parameters).await {
                            tracing::warn!("{}", e);
                        }
                    }
                    _ => {
                        tracing::warn!("Mapping on {} produced {:?} result", address, quality);
                        self.set_status(&address, MfmStatus::ProcessFailed);
                    }
                }
            }
            DeviceEventKind::ConnectionChanged(ConnectionState::Disconnected) => {
                tracing::warn!("{} disconnected during magnetic field mapping", address);
                self.set_status(&address, MfmStatus::Disconnected);
            }
            _ => {}
        }
    }

    /// Settle every unfinished device as `status`; collecting devices are stopped
    async fn end_pending(&self, status: MfmStatus) {
        let collecting = self.addresses_where(|s| s.is_cancelable());
        for address in self.addresses_where(|s| !s.is_done()) {
            self.set_status(&address, status);
        }
        join_all(collecting.iter().map(|a| self.send_stop(a))).await;
    }

    async fn send_stop(&self, address: &str) {
        let Some(handle) = self.registry.get(address) else {
            return;
        };
        let device = handle.device();
        // Failures are logged by the pacer; there is nothing to undo
        let _ = self.pacer.send("stop mfm", address, || device.stop_mfm()).await;
    }

    async fn write_back(&self, address: &str, parameters: &[u8]) -> MfmResult<()> {
        self.set_status(address, MfmStatus::Writing);
        let result = match self.registry.get(address) {
            Some(handle) => {
                let device = handle.device();
                self.pacer
                    .send("write mfm result", address, || {
                        device.write_mfm_result(parameters)
                    })
                    .await
                    .map_err(|e| e.to_string())
            }
            None => Err("device is no longer registered".to_string()),
        };
        match result {
            Ok(()) => {
                self.set_status(address, MfmStatus::Finished);
                Ok(())
            }
            Err(message) => {
                self.set_status(address, MfmStatus::WriteFailed);
                Err(MfmError::WriteFailed {
                    address: address.to_string(),
                    message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::SimCommand;
    use crate::mfm::MfmOutcome;
    use crate::device::MfmQuality;
    use crate::test_support::Rig;

    fn mfm(rig: &Rig) -> MfmSession {
        MfmSession::new(
            rig.registry.clone(),
            rig.bus.clone(),
            rig.emitter.clone(),
            &rig.config,
        )
    }

    async fn wait_for_status(session: &MfmSession, address: &str, status: MfmStatus) {
        for _ in 0..200 {
            if session.device(address).map(|d| d.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("{address} never reached {status:?}");
    }

    #[tokio::test]
    async fn test_maps_and_writes_every_device() {
        let rig = Rig::new(&["A", "B"]);
        let session = mfm(&rig);
        let mut coordinator_events = rig.emitter.subscribe();

        let report = session.start_all(&rig.addresses()).await.unwrap();

        assert_eq!(report.outcome, MfmOutcome::Completed);
        assert_eq!(report.finished(), vec!["A".to_string(), "B".to_string()]);
        for device in &rig.devices {
            assert_eq!(device.call_count(SimCommand::StartMfm), 1);
            assert_eq!(device.call_count(SimCommand::StopMfm), 1);
            assert_eq!(device.call_count(SimCommand::WriteMfmResult), 1);
        }
        assert_eq!(report.devices["A"].percent, 100);
        assert_eq!(report.devices["A"].quality, Some(MfmQuality::Good));
        assert!(!session.is_running());

        let mut progress = 0;
        let mut done = None;
        while let Ok(event) = coordinator_events.try_recv() {
            match event {
                CoordinatorEvent::MfmProgress { .. } => progress += 1,
                CoordinatorEvent::MfmDone { outcome, .. } => done = Some(outcome),
                _ => {}
            }
        }
        assert_eq!(progress, 4);
        assert_eq!(done, Some(MfmOutcome::Completed));
    }

    #[tokio::test]
    async fn test_unusable_result_is_not_written() {
        let rig = Rig::new(&["A", "B"]);
        rig.device("B").set_behavior(|b| b.mfm_quality = Some(MfmQuality::Bad));
        let session = mfm(&rig);

        let report = session.start_all(&rig.addresses()).await.unwrap();
        assert_eq!(report.outcome, MfmOutcome::PartiallyCompleted);
        assert_eq!(report.devices["B"].status, MfmStatus::ProcessFailed);
        assert_eq!(rig.device("B").call_count(SimCommand::WriteMfmResult), 0);
        assert_eq!(report.failed(), vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_start_failure_is_per_device() {
        let rig = Rig::new(&["A", "B"]);
        rig.device("B").set_behavior(|b| {
            b.reject_always.insert(SimCommand::StartMfm);
        });
        let session = mfm(&rig);

        let report = session.start_all(&rig.addresses()).await.unwrap();
        assert_eq!(report.devices["A"].status, MfmStatus::Finished);
        assert_eq!(report.devices["B"].status, MfmStatus::StartFailed);
        assert_eq!(report.outcome, MfmOutcome::PartiallyCompleted);
    }

    #[tokio::test]
    async fn test_write_failure_then_rewrite() {
        let rig = Rig::new(&["A"]);
        rig.device("A").set_behavior(|b| {
            b.reject_first.insert(SimCommand::WriteMfmResult, 1);
        });
        let session = mfm(&rig);

        let report = session.start_all(&rig.addresses()).await.unwrap();
        assert_eq!(report.devices["A"].status, MfmStatus::WriteFailed);
        assert_eq!(report.outcome, MfmOutcome::Failed);

        let device = session.rewrite("A").await.unwrap();
        assert_eq!(device.status, MfmStatus::Finished);
        assert_eq!(rig.device("A").call_count(SimCommand::WriteMfmResult), 2);
    }

    #[tokio::test]
    async fn test_rewrite_without_result() {
        let rig = Rig::new(&["A"]);
        let session = mfm(&rig);
        assert!(matches!(
            session.rewrite("A").await,
            Err(MfmError::NoResult { .. })
        ));
        assert!(matches!(session.cancel(), Err(MfmError::NotRunning)));
    }

    #[tokio::test]
    async fn test_collection_timeout_fails_device() {
        let mut rig = Rig::new(&["A"]);
        rig.config.mfm_timeout_ms = 100;
        rig.device("A").set_behavior(|b| b.mfm_progress = vec![40]);
        let session = mfm(&rig);

        let report = session.start_all(&rig.addresses()).await.unwrap();
        assert_eq!(report.outcome, MfmOutcome::TimedOut);
        assert_eq!(report.devices["A"].status, MfmStatus::ProcessFailed);
        assert_eq!(report.devices["A"].percent, 40);
        assert_eq!(rig.device("A").call_count(SimCommand::StopMfm), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_collecting() {
        let rig = Rig::new(&["A", "B"]);
        for device in &rig.devices {
            device.set_behavior(|b| b.mfm_progress = vec![20]);
        }
        let session = Arc::new(mfm(&rig));
        let running = {
            let session = Arc::clone(&session);
            let participants = rig.addresses();
            tokio::spawn(async move { session.start_all(&participants).await })
        };
        wait_for_status(&session, "A", MfmStatus::Started).await;
        wait_for_status(&session, "B", MfmStatus::Started).await;

        session.cancel().unwrap();
        let report = running.await.unwrap().unwrap();
        assert_eq!(report.outcome, MfmOutcome::Cancelled);
        assert!(report
            .devices
            .values()
            .all(|d| d.status == MfmStatus::Stopped));
        assert_eq!(rig.device("A").call_count(SimCommand::StopMfm), 1);
        assert_eq!(rig.device("A").call_count(SimCommand::WriteMfmResult), 0);
    }

    #[tokio::test]
    async fn test_cancel_refused_while_processing() {
        let mut rig = Rig::new(&["A"]);
        rig.config.mfm_timeout_ms = 300;
        rig.device("A").set_behavior(|b| {
            b.mfm_progress = vec![100];
            b.mfm_quality = None;
        });
        let session = Arc::new(mfm(&rig));
        let running = {
            let session = Arc::clone(&session);
            let participants = rig.addresses();
            tokio::spawn(async move { session.start_all(&participants).await })
        };
        wait_for_status(&session, "A", MfmStatus::Processing).await;

        match session.cancel() {
            Err(MfmError::NotCancelable { busy }) => assert_eq!(busy, vec!["A".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
        let report = running.await.unwrap().unwrap();
        assert_eq!(report.outcome, MfmOutcome::TimedOut);
        assert_eq!(report.devices["A"].status, MfmStatus::ProcessFailed);
    }

    #[tokio::test]
    async fn test_disconnect_ends_device() {
        let rig = Rig::new(&["A", "B"]);
        rig.device("A").set_behavior(|b| b.mfm_progress = vec![30]);
        let session = mfm(&rig);

        let device = rig.device("A").clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            device.emit(DeviceEventKind::ConnectionChanged(ConnectionState::Disconnected));
        });

        let report = session.start_all(&rig.addresses()).await.unwrap();
        assert_eq!(report.devices["A"].status, MfmStatus::Disconnected);
        assert_eq!(report.devices["B"].status, MfmStatus::Finished);
        assert_eq!(report.outcome, MfmOutcome::PartiallyCompleted);
    }

    #[tokio::test]
    async fn test_requires_connected_participants() {
        let rig = Rig::new(&["A", "B"]);
        rig.registry.apply_event(&DeviceEvent::new(
            "B",
            DeviceEventKind::ConnectionChanged(ConnectionState::Disconnected),
        ));
        let session = mfm(&rig);

        match session.start_all(&rig.addresses()).await {
            Err(MfmError::PreconditionFailed { not_connected }) => {
                assert_eq!(not_connected, vec!["B".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rig.device("A").call_count(SimCommand::StartMfm), 0);
        assert!(matches!(
            session.start_all(&[]).await,
            Err(MfmError::NoParticipants)
        ));
    }
}
