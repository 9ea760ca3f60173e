//! Device event bus
//!
//! Transports publish callbacks here; each session subscribes before it
//! issues commands and consumes events on its own task.

use super::traits::{
    ConnectionState, MfmQuality, RecordingAckState, RecordingCommand, RecordingFileInfo,
    SensorSample,
};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// An asynchronous callback from one device
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub address: String,
    pub kind: DeviceEventKind,
}

impl DeviceEvent {
    pub fn new(address: impl Into<String>, kind: DeviceEventKind) -> Self {
        Self {
            address: address.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DeviceEventKind {
    ConnectionChanged(ConnectionState),
    TagChanged(String),
    BatteryChanged { percentage: u8, charging: bool },
    /// Progress of the running synchronization, 0..=100
    SyncProgress(u8),
    SyncResult { success: bool },
    Telemetry(SensorSample),
    RecordingNotification { enabled: bool },
    FlashInfo { used_bytes: u64, total_bytes: u64 },
    RecordingAck {
        command: RecordingCommand,
        state: RecordingAckState,
    },
    FileInfo {
        files: Vec<RecordingFileInfo>,
        success: bool,
    },
    FileExported(RecordingFileInfo),
    AllDataExported,
    ExportStopped,
    /// Mapping data collected so far, 0..=100
    MfmProgress(u8),
    MfmCompleted {
        quality: MfmQuality,
        parameters: Option<Vec<u8>>,
    },
}

/// Outcome of waiting for the next event
#[derive(Debug)]
pub enum Next {
    Event(DeviceEvent),
    TimedOut,
    Closed,
}

/// Publishing side, cloned into every transport
#[derive(Clone)]
pub struct DeviceEventBus {
    tx: broadcast::Sender<DeviceEvent>,
}

impl DeviceEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: DeviceEvent) {
        // No subscribers just means nobody is running a session right now
        if self.tx.send(event).is_err() {
            tracing::trace!("Device event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> DeviceEventStream {
        DeviceEventStream {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side owned by one session
pub struct DeviceEventStream {
    rx: broadcast::Receiver<DeviceEvent>,
}

impl DeviceEventStream {
    /// Next event, or `None` once every publisher is gone
    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Device event stream lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already queued event, without waiting
    pub fn try_recv(&mut self) -> Option<DeviceEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Device event stream lagged, {} events skipped", skipped);
                }
                Err(_) => return None,
            }
        }
    }

    /// Next event arriving before `deadline`
    pub async fn recv_until(&mut self, deadline: Instant) -> Next {
        match tokio::time::timeout_at(deadline, self.recv()).await {
            Ok(Some(event)) => Next::Event(event),
            Ok(None) => Next::Closed,
            Err(_) => Next::TimedOut,
        }
    }
}
