//! Export session
//!
//! Pulls recorded files off a participant set into one timestamped
//! directory. Preparation lists the files on every device; the caller picks
//! files per device, then every device with a non-empty pick exports them
//! concurrently. The session ends when every exporting device has reported
//! completion, failed, or been stopped.

use super::types::{
    DeviceExportState, ExportError, ExportOutcome, ExportProgress, ExportReport, ExportResult,
    ExportSelection, SchemaSelection,
};
use crate::config::CoordinatorConfig;
use crate::device::{
    ConnectionState, DeviceEvent, DeviceEventBus, DeviceEventKind, DeviceEventStream,
    DeviceRegistry, ExportField, Next, RecordingFileInfo, DEFAULT_EXPORT_FIELDS,
};
use crate::events::{CoordinatorEvent, EventEmitter};
use crate::recorder::{RecordingError, RecordingFlow};
use crate::session::{
    Arrival, CommandOutcome, CommandPacer, CommandReport, DeviceFailure, FailureReason,
    ResponseBarrier, SessionSlot,
};
use crate::utils::time::file_stamp;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct ExportSession {
    registry: Arc<DeviceRegistry>,
    bus: DeviceEventBus,
    emitter: EventEmitter,
    pacer: CommandPacer,
    barrier_timeout: Duration,
    ack_timeout: Duration,
    export_timeout: Duration,
    storage_threshold: u8,
    export_root: PathBuf,
    slot: SessionSlot,

    /// Result of the last preparation. Locked for the whole of `prepare`,
    /// and by `start_exporting` while it snapshots participants and files.
    flow: tokio::sync::Mutex<Option<RecordingFlow>>,

    /// Copies of the prepared state, readable while an operation runs
    participants: RwLock<Vec<String>>,
    files: RwLock<BTreeMap<String, Vec<RecordingFileInfo>>>,

    /// Fields accepted by at least one device
    schema: RwLock<Option<Vec<ExportField>>>,

    /// Cancels the running export
    cancel: Mutex<Option<CancellationToken>>,

    progress: RwLock<BTreeMap<String, ExportProgress>>,
    report: RwLock<Option<ExportReport>>,
}

impl ExportSession {
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
            export_timeout: config.export_timeout(),
            storage_threshold: config.storage_threshold_percent,
            export_root: config.export_root.clone(),
            slot: SessionSlot::new(),
            flow: tokio::sync::Mutex::new(None),
            participants: RwLock::new(Vec::new()),
            files: RwLock::new(BTreeMap::new()),
            schema: RwLock::new(None),
            cancel: Mutex::new(None),
            progress: RwLock::new(BTreeMap::new()),
            report: RwLock::new(None),
        }
    }

    pub fn is_exporting(&self) -> bool {
        self.slot.is_busy()
    }

    pub fn participants(&self) -> Vec<String> {
        self.participants.read().clone()
    }

    /// Files found on each device by the last preparation, most recent first
    pub fn file_lists(&self) -> BTreeMap<String, Vec<RecordingFileInfo>> {
        self.files.read().clone()
    }

    pub fn schema(&self) -> Option<Vec<ExportField>> {
        self.schema.read().clone()
    }

    pub fn progress(&self) -> Vec<ExportProgress> {
        self.progress.read().values().cloned().collect()
    }

    /// Report of the running or most recent export
    pub fn current_report(&self) -> Option<ExportReport> {
        self.report.read().clone()
    }

    /// Enable notifications, read flash info, then list files on every participant
    pub async fn prepare(
        &self,
        participants: &[String],
    ) -> ExportResult<BTreeMap<String, Vec<RecordingFileInfo>>> {
        if self.is_exporting() {
            return Err(ExportError::AlreadyExporting);
        }
        if participants.is_empty() {
            return Err(ExportError::NoParticipants);
        }
        let not_connected = self.registry.not_connected(participants);
        if !not_connected.is_empty() {
            return Err(ExportError::PreconditionFailed { not_connected });
        }

        let mut current = self.flow.lock().await;
        // An export that started while we waited for the lock owns the state
        if self.is_exporting() {
            return Err(ExportError::AlreadyExporting);
        }
        let mut events = self.bus.subscribe();
        let mut flow = RecordingFlow::new(
            Arc::clone(&self.registry),
            self.emitter.clone(),
            self.pacer,
            self.storage_threshold,
            participants,
        );
        match flow.prepare(&mut events, self.barrier_timeout).await {
            Ok(_) => {}
            Err(RecordingError::Timeout { missing }) => {
                return Err(ExportError::Timeout { pending: missing })
            }
            Err(e) => {
                tracing::warn!("Export preparation failed: {}", e);
                return Err(ExportError::NotPrepared);
            }
        }
        let lists = flow.request_file_info(&mut events, self.barrier_timeout).await;

        *self.participants.write() = flow.participants();
        *self.files.write() = lists.clone();
        *self.schema.write() = None;
        *current = Some(flow);
        Ok(lists)
    }

    /// Choose the data fields every device exports
    ///
    /// Succeeds when at least one participant accepts the fields.
    pub async fn select_export_fields(&self, fields: &[ExportField]) -> ExportResult<SchemaSelection> {
        let participants = self.participants();
        if participants.is_empty() {
            return Err(ExportError::NotPrepared);
        }
        self.apply_schema(&participants, fields).await
    }

    async fn apply_schema(
        &self,
        participants: &[String],
        fields: &[ExportField],
    ) -> ExportResult<SchemaSelection> {
        let pacer = self.pacer;
        let sends = participants.iter().map(|address| {
            let handle = self.registry.get(address);
            async move {
                let Some(handle) = handle else {
                    return (address.clone(), Err(FailureReason::NotRegistered));
                };
                let device = handle.device();
                let outcome = pacer
                    .send_with_retry("select export fields", address, || {
                        device.select_exported_data(fields)
                    })
                    .await;
                match outcome {
                    CommandOutcome::Failed(e) => (
                        address.clone(),
                        Err(FailureReason::CommandFailedAfterRetry {
                            message: e.to_string(),
                        }),
                    ),
                    _ => (address.clone(), Ok(())),
                }
            }
        });

        let mut selection = SchemaSelection {
            fields: fields.to_vec(),
            accepted: Vec::new(),
            failed: Vec::new(),
        };
        for (address, result) in join_all(sends).await {
            match result {
                Ok(()) => selection.accepted.push(address),
                Err(reason) => selection.failed.push(DeviceFailure::new(address, reason)),
            }
        }

        if selection.accepted.is_empty() {
            let failed: Vec<String> = selection.failed.iter().map(|f| f.address.clone()).collect();
            tracing::error!("Every device rejected the export fields");
            return Err(ExportError::SchemaRejectedByAllDevices { failed });
        }
        tracing::info!(
            "Export fields {:?} accepted by {:?}",
            selection.fields,
            selection.accepted
        );
        *self.schema.write() = Some(selection.fields.clone());
        Ok(selection)
    }

    /// Export the selected files into `<export_root>/recordings/<stamp>`
    ///
    /// Devices without selected files are skipped. Uses the default fields
    /// if none were chosen. Returns once every exporting device has
    /// finished, failed or been stopped.
    pub async fn start_exporting(&self, selection: &ExportSelection) -> ExportResult<ExportReport> {
        let _guard = self.slot.try_acquire().ok_or(ExportError::AlreadyExporting)?;
        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());
        let result = self.run_export(selection, &cancel).await;
        *self.cancel.lock() = None;
        result
    }

    /// Participants and their file lists as left by the last preparation
    ///
    /// Waits for a preparation in progress to finish.
    async fn prepared_snapshot(&self) -> Option<(Vec<String>, BTreeMap<String, Vec<RecordingFileInfo>>)> {
        let current = self.flow.lock().await;
        current
            .as_ref()
            .map(|flow| (flow.participants(), flow.file_lists()))
    }

    async fn run_export(
        &self,
        selection: &ExportSelection,
        cancel: &CancellationToken,
    ) -> ExportResult<ExportReport> {
        let Some((participants, files)) = self.prepared_snapshot().await else {
            return Err(ExportError::NotPrepared);
        };
        if participants.is_empty() {
            return Err(ExportError::NotPrepared);
        }
        for address in selection.devices() {
            match files.get(&address) {
                None => tracing::warn!("Ignoring files selected on non-participant {}", address),
                Some(listed) if !selection.files(&address).iter().all(|f| listed.contains(f)) => {
                    tracing::warn!("Selection on {} includes files not listed at preparation", address)
                }
                Some(_) => {}
            }
        }
        let targets: Vec<String> = participants
            .iter()
            .filter(|a| selection.file_count(a) > 0)
            .cloned()
            .collect();
        if targets.is_empty() {
            return Err(ExportError::NoFilesSelected);
        }

        let directory = self.export_root.join("recordings").join(file_stamp());
        if let Err(source) = tokio::fs::create_dir_all(&directory).await {
            tracing::error!("Failed to create export directory {:?}: {}", directory, source);
            self.emitter.emit(CoordinatorEvent::ExportFailed {
                directory: None,
                reason: source.to_string(),
                failed: targets.clone(),
            });
            return Err(ExportError::DirectoryCreateFailed {
                path: directory,
                source,
            });
        }

        if cancel.is_cancelled() {
            return self.abort_before_start(directory).await;
        }
        let needs_schema = self.schema.read().is_none();
        if needs_schema {
            if let Err(e) = self.apply_schema(&participants, &DEFAULT_EXPORT_FIELDS).await {
                remove_empty_dir(&directory).await;
                self.emitter.emit(CoordinatorEvent::ExportFailed {
                    directory: None,
                    reason: e.to_string(),
                    failed: targets.clone(),
                });
                return Err(e);
            }
        }
        if cancel.is_cancelled() {
            return self.abort_before_start(directory).await;
        }

        self.progress.write().clear();
        let mut events = self.bus.subscribe();

        let mut report = self.issue_start(&targets, selection, &directory).await;
        *self.report.write() = Some(report.clone());
        self.emitter.emit(CoordinatorEvent::ExportStarted {
            directory: directory.clone(),
            in_progress: report.in_progress(),
            failed: report.failed_addresses(),
        });
        tracing::info!(
            "Export started into {:?}: {} of {} devices exporting",
            directory,
            report.in_progress_count,
            report.total_exporting_count
        );

        let aborted = if report.in_progress_count > 0 {
            self.await_completion(&mut events, cancel, selection, &mut report)
                .await
        } else {
            false
        };

        self.finish(report, aborted)
    }

    /// End an export stopped before any start command went out
    async fn abort_before_start(&self, directory: PathBuf) -> ExportResult<ExportReport> {
        tracing::info!("Export stopped before devices were started");
        remove_empty_dir(&directory).await;
        let mut report = ExportReport::new(directory);
        report.outcome = ExportOutcome::Aborted;
        *self.report.write() = Some(report.clone());
        self.emitter.emit(CoordinatorEvent::ExportFailed {
            directory: None,
            reason: format!("{:?}", ExportOutcome::Aborted),
            failed: Vec::new(),
        });
        Err(ExportError::ExportAborted(Box::new(report)))
    }

    async fn issue_start(
        &self,
        targets: &[String],
        selection: &ExportSelection,
        directory: &Path,
    ) -> ExportReport {
        let pacer = self.pacer;
        let sends = targets.iter().map(|address| {
            let handle = self.registry.get(address);
            let files = selection.files(address).to_vec();
            async move {
                let Some(handle) = handle else {
                    return (address.clone(), Err(FailureReason::NotRegistered));
                };
                let device = handle.device();
                let outcome = pacer
                    .send_with_retry("start exporting", address, || {
                        device.start_exporting(&files, directory)
                    })
                    .await;
                match outcome {
                    CommandOutcome::Failed(e) => (
                        address.clone(),
                        Err(FailureReason::CommandFailedAfterRetry {
                            message: e.to_string(),
                        }),
                    ),
                    _ => (address.clone(), Ok(())),
                }
            }
        });

        let mut report = ExportReport::new(directory.to_path_buf());
        report.total_exporting_count = targets.len();
        for (address, result) in join_all(sends).await {
            let state = match result {
                Ok(()) => {
                    report.in_progress_count += 1;
                    report.exported_files.insert(address.clone(), Vec::new());
                    DeviceExportState::InProgress
                }
                Err(reason) => DeviceExportState::Failed(reason),
            };
            report.devices.insert(address, state);
        }
        report
    }

    /// Pump device events until every exporting device has settled
    ///
    /// Returns true when the export was stopped by the caller.
    async fn await_completion(
        &self,
        events: &mut DeviceEventStream,
        cancel: &CancellationToken,
        selection: &ExportSelection,
        report: &mut ExportReport,
    ) -> bool {
        let mut barrier = ResponseBarrier::new(report.in_progress());
        let mut deadline = Instant::now() + self.export_timeout;
        let mut aborted = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !aborted => {
                    tracing::info!("Export stop requested, waiting for devices to confirm");
                    aborted = true;
                    deadline = deadline.min(Instant::now() + self.ack_timeout);
                    continue;
                }
                next = events.recv_until(deadline) => next,
            };

            let DeviceEvent { address, kind } = match next {
                Next::Event(event) => event,
                Next::TimedOut | Next::Closed => {
                    let pending = report.in_progress();
                    if !aborted {
                        tracing::warn!("Export timed out waiting for {:?}", pending);
                    }
                    for address in pending {
                        let state = if aborted {
                            DeviceExportState::Stopped
                        } else {
                            DeviceExportState::Failed(FailureReason::TimedOut)
                        };
                        report.settle(&address, state);
                    }
                    return aborted;
                }
            };
            if report.devices.get(&address) != Some(&DeviceExportState::InProgress) {
                continue;
            }

            let settled = match kind {
                DeviceEventKind::FileExported(file) => {
                    let exported = report.exported_files.entry(address.clone()).or_default();
                    exported.push(file.clone());
                    let count = exported.len();
                    self.progress.write().insert(
                        address.clone(),
                        ExportProgress::new(address.clone(), count, selection.file_count(&address)),
                    );
                    self.emitter.emit(CoordinatorEvent::ExportProgress {
                        address: address.clone(),
                        file,
                        exported_files: count,
                    });
                    None
                }
                DeviceEventKind::AllDataExported => {
                    tracing::info!("{} finished exporting", address);
                    self.emitter.emit(CoordinatorEvent::ExportDeviceDone {
                        address: address.clone(),
                    });
                    Some(DeviceExportState::Completed)
                }
                DeviceEventKind::ExportStopped => Some(DeviceExportState::Stopped),
                DeviceEventKind::ConnectionChanged(ConnectionState::Disconnected) => {
                    tracing::warn!("{} disconnected while exporting", address);
                    Some(DeviceExportState::Failed(FailureReason::Disconnected))
                }
                _ => None,
            };

            if let Some(state) = settled {
                report.settle(&address, state);
                if barrier.arrive(&address) == Arrival::Opened {
                    return aborted;
                }
            }
        }
    }

    fn finish(&self, mut report: ExportReport, aborted: bool) -> ExportResult<ExportReport> {
        let completed = report.completed();
        let timed_out: Vec<String> = report
            .devices
            .iter()
            .filter(|(_, s)| **s == DeviceExportState::Failed(FailureReason::TimedOut))
            .map(|(a, _)| a.clone())
            .collect();
        let all_completed = completed.len() == report.devices.len();

        report.outcome = if aborted {
            ExportOutcome::Aborted
        } else if completed.is_empty() && !timed_out.is_empty() {
            ExportOutcome::TimedOut
        } else if completed.is_empty() {
            ExportOutcome::Failed
        } else if all_completed {
            ExportOutcome::Completed
        } else {
            ExportOutcome::PartiallyCompleted
        };
        *self.report.write() = Some(report.clone());

        let failed = report.failed_addresses();
        match report.outcome {
            ExportOutcome::Completed | ExportOutcome::PartiallyCompleted => {
                tracing::info!("Export done: completed {:?}, failed {:?}", completed, failed);
                self.emitter.emit(CoordinatorEvent::ExportDone {
                    directory: report.directory.clone(),
                    completed,
                    failed,
                });
                Ok(report)
            }
            outcome => {
                tracing::warn!("Export ended {:?}, failed {:?}", outcome, failed);
                self.emitter.emit(CoordinatorEvent::ExportFailed {
                    directory: Some(report.directory.clone()),
                    reason: format!("{outcome:?}"),
                    failed,
                });
                match outcome {
                    ExportOutcome::Aborted => Err(ExportError::ExportAborted(Box::new(report))),
                    ExportOutcome::TimedOut => Err(ExportError::Timeout { pending: timed_out }),
                    _ => Err(ExportError::AllDevicesFailed(Box::new(report))),
                }
            }
        }
    }

    /// Stop exporting on every participant and end the running export
    ///
    /// Each device gets one retry. Safe to call when nothing is exporting.
    pub async fn stop_exporting(&self) -> CommandReport {
        if let Some(cancel) = self.cancel.lock().as_ref() {
            cancel.cancel();
        }

        let pacer = self.pacer;
        let participants = self.participants();
        let sends = participants.iter().map(|address| {
            let handle = self.registry.get(address);
            async move {
                let Some(handle) = handle else {
                    return (address.clone(), Err(FailureReason::NotRegistered));
                };
                let device = handle.device();
                match pacer
                    .send_with_retry("stop exporting", address, || device.stop_exporting())
                    .await
                {
                    CommandOutcome::Failed(e) => (
                        address.clone(),
                        Err(FailureReason::CommandFailedAfterRetry {
                            message: e.to_string(),
                        }),
                    ),
                    _ => (address.clone(), Ok(())),
                }
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
}

async fn remove_empty_dir(directory: &Path) {
    if let Err(e) = tokio::fs::remove_dir(directory).await {
        tracing::debug!("Could not remove empty export directory: {}", e);
    }
}
