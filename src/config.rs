//! Coordinator configuration
//!
//! Timing and storage parameters shared by every session type. All values
//! have defaults matching the behavior of the sensors in the field; a JSON
//! file may override any subset of them.

use crate::device::MeasurementMode;
use crate::utils::error::CoordinatorResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinatorConfig {
    /// Delay before each command sent to a device (milliseconds)
    pub command_pacing_ms: u64,

    /// Delay before retrying a rejected command (milliseconds)
    pub retry_delay_ms: u64,

    /// Upper bound for the flash-info and file-info barriers (milliseconds)
    pub barrier_timeout_ms: u64,

    /// Upper bound for start/stop acknowledgments (milliseconds)
    pub ack_timeout_ms: u64,

    /// Default upper bound for a sync operation (milliseconds)
    pub sync_timeout_ms: u64,

    /// Upper bound for a whole export run (milliseconds)
    pub export_timeout_ms: u64,

    /// Time a device has to collect magnetic field mapping data (milliseconds)
    pub mfm_timeout_ms: u64,

    /// A device with this much free flash or less cannot start recording
    pub storage_threshold_percent: u8,

    /// Payload devices stream after a successful sync
    pub measurement_mode: MeasurementMode,

    /// Directory receiving one CSV per device per streaming session
    pub log_dir: PathBuf,

    /// Root under which each export run gets its own directory
    pub export_root: PathBuf,

    /// Capacity of the device event bus
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            command_pacing_ms: 30,
            retry_delay_ms: 40,
            barrier_timeout_ms: 10_000,
            ack_timeout_ms: 5_000,
            sync_timeout_ms: 60_000,
            export_timeout_ms: 30 * 60 * 1000,
            mfm_timeout_ms: 5 * 60 * 1000,
            storage_threshold_percent: 10,
            measurement_mode: MeasurementMode::CompleteEuler,
            log_dir: PathBuf::from("logs"),
            export_root: PathBuf::from("."),
            event_capacity: 1024,
        }
    }
}

impl CoordinatorConfig {
    /// Load a configuration file, falling back to defaults for missing keys
    pub fn load(path: &Path) -> CoordinatorResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        tracing::debug!("Loaded coordinator config from {:?}", path);
        Ok(config)
    }

    pub fn command_pacing(&self) -> Duration {
        Duration::from_millis(self.command_pacing_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_millis(self.export_timeout_ms)
    }

    pub fn mfm_timeout(&self) -> Duration {
        Duration::from_millis(self.mfm_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinator.json");
        std::fs::write(&path, r#"{ "commandPacingMs": 5, "logDir": "/tmp/dot-logs" }"#).unwrap();

        let config = CoordinatorConfig::load(&path).unwrap();
        assert_eq!(config.command_pacing(), Duration::from_millis(5));
        assert_eq!(config.log_dir, PathBuf::from("/tmp/dot-logs"));
        assert_eq!(config.retry_delay_ms, 40);
        assert_eq!(config.storage_threshold_percent, 10);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinator.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            CoordinatorConfig::load(&path),
            Err(crate::utils::error::CoordinatorError::Config(_))
        ));
    }
}
