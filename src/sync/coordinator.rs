//! Sync coordinator
//!
//! Designates a root, asks every participant to synchronize its clock to it,
//! and folds the participants' asynchronous reports into one [`SyncSession`].

use super::state::{SyncError, SyncPhase, SyncResult, SyncSession};
use crate::device::{
    ConnectionState, DeviceEvent, DeviceEventBus, DeviceEventKind, DeviceRegistry, Next,
};
use crate::events::{CoordinatorEvent, EventEmitter};
use crate::session::SessionSlot;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Runs at most one synchronization at a time across the registry
pub struct SyncCoordinator {
    registry: Arc<DeviceRegistry>,
    bus: DeviceEventBus,
    emitter: EventEmitter,
    slot: SessionSlot,

    /// Current coordinator state
    phase: Arc<RwLock<SyncPhase>>,

    /// Cancels the running sync
    cancel: Mutex<Option<CancellationToken>>,
}

impl SyncCoordinator {
    pub fn new(registry: Arc<DeviceRegistry>, bus: DeviceEventBus, emitter: EventEmitter) -> Self {
        Self {
            registry,
            bus,
            emitter,
            slot: SessionSlot::new(),
            phase: Arc::new(RwLock::new(SyncPhase::Idle)),
            cancel: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.read()
    }

    pub fn is_syncing(&self) -> bool {
        self.slot.is_busy()
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.write() = phase;
    }

    /// Synchronize `participants`, waiting at most `timeout` for their reports
    ///
    /// Per-device failures never fail the call; they are reported in the
    /// returned session. If any participant fails, measurement is stopped on
    /// every participant.
    pub async fn start_sync(&self, participants: &[String], timeout: Duration) -> SyncResult<SyncSession> {
        let _guard = self.slot.try_acquire().ok_or(SyncError::AlreadyInProgress)?;
        if participants.is_empty() {
            return Err(SyncError::NoParticipants);
        }

        let mut session = SyncSession::new(Uuid::new_v4(), participants.to_vec());
        let root = session.root.clone();
        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());

        // Subscribe before any command so no report is missed
        let mut events = self.bus.subscribe();

        tracing::info!(
            "Starting sync {} over {} devices, root {}",
            session.request_id,
            participants.len(),
            root
        );
        self.registry.set_sync_root(&root, true);
        self.set_phase(SyncPhase::RootAssigned);
        self.emitter.emit(CoordinatorEvent::SyncStarted {
            request_id: session.request_id,
            participants: session.participants.clone(),
            root: root.clone(),
        });

        self.issue_sync_commands(&mut session, &root).await;

        session.set_progress(0);
        self.set_phase(SyncPhase::SyncInProgress { progress: 0 });

        let deadline = Instant::now() + timeout;
        while !session.is_complete() {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Sync {} cancelled", session.request_id);
                    session.cancelled = true;
                    break;
                }
                next = events.recv_until(deadline) => match next {
                    Next::Event(event) => self.handle_event(&mut session, event),
                    Next::TimedOut => {
                        tracing::warn!(
                            "Sync {} timed out waiting for {:?}",
                            session.request_id,
                            session.pending()
                        );
                        session.timed_out = true;
                        break;
                    }
                    Next::Closed => break,
                },
            }
        }

        if session.cancelled {
            self.stop_syncing(&session.participants).await;
        }

        session.finish();
        self.complete(&session).await;
        *self.cancel.lock() = None;

        Ok(session)
    }

    /// Ask the running sync to stop; a no-op when idle
    pub fn stop_sync(&self) {
        if let Some(token) = self.cancel.lock().as_ref() {
            token.cancel();
        }
    }

    async fn issue_sync_commands(&self, session: &mut SyncSession, root: &str) {
        let mut commands = Vec::new();
        for address in &session.participants {
            match self.registry.get(address) {
                Some(handle) => commands.push(handle),
                None => {
                    tracing::warn!("Sync participant {} is no longer registered", address);
                }
            }
        }
        for address in session.pending() {
            if !commands.iter().any(|h| h.address() == address) {
                session.record(&address, false);
            }
        }

        let results = join_all(commands.iter().map(|handle| async move {
            let result = handle.device().start_syncing(root).await;
            (handle.address().to_string(), result)
        }))
        .await;

        for (address, result) in results {
            if let Err(e) = result {
                tracing::warn!("Device {} refused to start syncing: {}", address, e);
                session.record(&address, false);
            }
        }
    }

    fn handle_event(&self, session: &mut SyncSession, event: DeviceEvent) {
        if !session.is_participant(&event.address) {
            return;
        }
        match event.kind {
            DeviceEventKind::SyncProgress(progress) => {
                session.set_progress(progress);
                self.set_phase(SyncPhase::SyncInProgress {
                    progress: progress.min(100),
                });
                self.emitter.emit(CoordinatorEvent::SyncProgress {
                    request_id: session.request_id,
                    address: event.address,
                    progress: progress.min(100),
                });
            }
            DeviceEventKind::SyncResult { success } => {
                tracing::debug!("Sync result from {}: {}", event.address, success);
                session.record(&event.address, success);
            }
            DeviceEventKind::ConnectionChanged(ConnectionState::Disconnected) => {
                if session.record(&event.address, false) {
                    tracing::warn!("Device {} disconnected during sync", event.address);
                }
            }
            _ => {}
        }
    }

    async fn stop_syncing(&self, participants: &[String]) {
        let handles: Vec<_> = participants
            .iter()
            .filter_map(|a| self.registry.get(a))
            .collect();
        let results = join_all(handles.iter().map(|h| h.device().stop_syncing())).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("Failed to stop syncing on {}: {}", handle.address(), e);
            }
        }
    }

    /// Apply side effects of a finished session and return to idle
    async fn complete(&self, session: &SyncSession) {
        self.registry.set_sync_root(&session.root, false);
        for (address, success) in &session.per_device_result {
            if let Some(handle) = self.registry.get(address) {
                handle.update(|s| s.is_synced = *success);
            }
        }

        if session.overall_success {
            self.set_phase(SyncPhase::AllSucceeded);
            tracing::info!("Sync {} succeeded", session.request_id);
        } else {
            self.set_phase(SyncPhase::AnyFailed);
            tracing::error!(
                "Sync {} failed on {:?}, stopping measurement on all participants",
                session.request_id,
                session.failed_devices()
            );
            self.halt_measurement(&session.participants).await;
        }

        self.emitter.emit(CoordinatorEvent::SyncDone {
            request_id: session.request_id,
            success: session.overall_success,
            results: session.per_device_result.clone(),
            failed: session.failed_devices(),
        });
        self.set_phase(SyncPhase::Idle);
    }

    async fn halt_measurement(&self, participants: &[String]) {
        let handles: Vec<_> = participants
            .iter()
            .filter_map(|a| self.registry.get(a))
            .collect();
        let results = join_all(handles.iter().map(|h| h.device().stop_measuring())).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("Failed to stop measuring on {}: {}", handle.address(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::{SimCommand, SyncOutcome};
    use crate::test_support::Rig;

    fn coordinator(rig: &Rig) -> SyncCoordinator {
        SyncCoordinator::new(rig.registry.clone(), rig.bus.clone(), rig.emitter.clone())
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let rig = Rig::new(&["A", "B", "C"]);
        let sync = coordinator(&rig);

        let session = sync
            .start_sync(&rig.addresses(), Duration::from_secs(2))
            .await
            .unwrap();

        assert!(session.overall_success);
        assert!(session.failed_devices().is_empty());
        assert_eq!(sync.phase(), SyncPhase::Idle);
        assert!(!rig.registry.get("A").unwrap().status().is_sync_root);
        assert!(rig.registry.get("B").unwrap().status().is_synced);
        assert_eq!(rig.device("A").call_count(SimCommand::StopMeasuring), 0);
    }

    #[tokio::test]
    async fn test_one_failure_fails_all_and_halts_measurement() {
        let rig = Rig::new(&["A", "B", "C"]);
        rig.device("C").set_behavior(|b| b.sync = SyncOutcome::Fail);
        let sync = coordinator(&rig);
        let mut outward = rig.emitter.subscribe();

        let session = sync
            .start_sync(&rig.addresses(), Duration::from_secs(2))
            .await
            .unwrap();

        assert!(!session.overall_success);
        assert_eq!(session.failed_devices(), vec!["C".to_string()]);
        for address in ["A", "B", "C"] {
            assert_eq!(rig.device(address).call_count(SimCommand::StopMeasuring), 1);
            assert_eq!(rig.device(address).call_count(SimCommand::StartMeasuring), 0);
        }
        assert!(!rig.registry.get("A").unwrap().status().is_sync_root);

        let mut saw_done = false;
        while let Ok(event) = outward.try_recv() {
            if let CoordinatorEvent::SyncDone { success, failed, .. } = event {
                assert!(!success);
                assert_eq!(failed, vec!["C".to_string()]);
                saw_done = true;
            }
        }
        assert!(saw_done);
    }

    #[tokio::test]
    async fn test_disconnect_mid_sync_is_failure() {
        let rig = Rig::new(&["A", "B"]);
        rig.device("B").set_behavior(|b| b.sync = SyncOutcome::Disconnect);
        let sync = coordinator(&rig);

        let session = sync
            .start_sync(&rig.addresses(), Duration::from_secs(2))
            .await
            .unwrap();

        assert!(!session.overall_success);
        assert!(!session.timed_out);
        assert_eq!(session.per_device_result.get("B"), Some(&false));
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let rig = Rig::new(&["A", "B"]);
        rig.device("B").set_behavior(|b| b.sync = SyncOutcome::Silent);
        let sync = coordinator(&rig);

        let session = sync
            .start_sync(&rig.addresses(), Duration::from_millis(100))
            .await
            .unwrap();

        assert!(session.timed_out);
        assert!(!session.overall_success);
        assert_eq!(session.failed_devices(), vec!["B".to_string()]);
        assert!(!sync.is_syncing());
    }

    #[tokio::test]
    async fn test_empty_participants_rejected() {
        let rig = Rig::new(&[]);
        let sync = coordinator(&rig);
        assert_eq!(
            sync.start_sync(&[], Duration::from_secs(1)).await.unwrap_err(),
            SyncError::NoParticipants
        );
    }

    #[tokio::test]
    async fn test_second_sync_rejected_while_running() {
        let rig = Rig::new(&["A"]);
        rig.device("A").set_behavior(|b| b.sync = SyncOutcome::Silent);
        let sync = Arc::new(coordinator(&rig));

        let running = {
            let sync = Arc::clone(&sync);
            let participants = rig.addresses();
            tokio::spawn(async move { sync.start_sync(&participants, Duration::from_secs(5)).await })
        };
        while !sync.is_syncing() {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            sync.start_sync(&rig.addresses(), Duration::from_secs(1)).await.unwrap_err(),
            SyncError::AlreadyInProgress
        );

        sync.stop_sync();
        let session = running.await.unwrap().unwrap();
        assert!(session.cancelled);
        assert!(!session.overall_success);
        assert_eq!(rig.device("A").call_count(SimCommand::StopSyncing), 1);
    }

    #[tokio::test]
    async fn test_unregistered_participant_fails_without_command() {
        let rig = Rig::new(&["A"]);
        let sync = coordinator(&rig);

        let session = sync
            .start_sync(&["A".to_string(), "GONE".to_string()], Duration::from_secs(2))
            .await
            .unwrap();

        assert!(!session.overall_success);
        assert_eq!(session.per_device_result.get("A"), Some(&true));
        assert_eq!(session.per_device_result.get("GONE"), Some(&false));
    }
}
