//! Per-device sample logging
//!
//! Each streaming participant gets one CSV file. A few `#`-prefixed lines
//! describe the device, followed by one row per telemetry packet.

use crate::device::{MeasurementMode, SensorSample};
use crate::utils::time::file_stamp;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Destination for one device's telemetry
pub trait SampleSink: Send {
    fn write(&mut self, sample: &SensorSample) -> io::Result<()>;

    fn path(&self) -> &Path;

    /// Flush and close; consumes the sink so it cannot be closed twice
    fn close(self: Box<Self>) -> io::Result<u64>;
}

/// Device description written at the top of a log file
#[derive(Debug, Clone)]
pub struct LogHeader {
    pub label: String,
    pub address: String,
    pub is_synced: bool,
    pub measurement_mode: MeasurementMode,
}

const COLUMNS: [&str; 18] = [
    "PacketCounter",
    "SampleTimeFine",
    "Euler_X",
    "Euler_Y",
    "Euler_Z",
    "Quat_W",
    "Quat_X",
    "Quat_Y",
    "Quat_Z",
    "FreeAcc_X",
    "FreeAcc_Y",
    "FreeAcc_Z",
    "Acc_X",
    "Acc_Y",
    "Acc_Z",
    "Gyr_X",
    "Gyr_Y",
    "Gyr_Z",
];

pub struct CsvSampleLogger {
    path: PathBuf,
    writer: csv::Writer<File>,
    written: u64,
}

impl CsvSampleLogger {
    /// Create `<dir>/<label>_<stamp>.csv` and write the header
    ///
    /// Fails if the file already exists; an existing log is never truncated.
    pub fn create(dir: &Path, header: &LogHeader) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}_{}.csv", header.label, file_stamp()));
        Self::create_at(path, header)
    }

    fn create_at(path: PathBuf, header: &LogHeader) -> io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        writeln!(file, "# Tag: {}", header.label)?;
        writeln!(file, "# Address: {}", header.address)?;
        writeln!(file, "# Synced: {}", header.is_synced)?;
        writeln!(file, "# Measurement mode: {}", header.measurement_mode.label())?;

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(COLUMNS)?;
        tracing::debug!("Opened sample log {:?}", path);

        Ok(Self {
            path,
            writer,
            written: 0,
        })
    }
}

fn push_opt<const N: usize, T: ToString>(row: &mut Vec<String>, values: Option<[T; N]>) {
    match values {
        Some(values) => row.extend(values.iter().map(|v| v.to_string())),
        None => row.extend(std::iter::repeat(String::new()).take(N)),
    }
}

impl SampleSink for CsvSampleLogger {
    fn write(&mut self, sample: &SensorSample) -> io::Result<()> {
        let mut row = Vec::with_capacity(COLUMNS.len());
        row.push(sample.packet_counter.to_string());
        row.push(sample.sample_time_fine.to_string());
        push_opt(&mut row, sample.euler);
        push_opt(&mut row, sample.quaternion);
        push_opt(&mut row, sample.free_acc);
        push_opt(&mut row, sample.acc);
        push_opt(&mut row, sample.gyr);
        self.writer.write_record(&row)?;
        self.written += 1;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn close(mut self: Box<Self>) -> io::Result<u64> {
        self.writer.flush()?;
        tracing::debug!("Closed sample log {:?} ({} samples)", self.path, self.written);
        Ok(self.written)
    }
}

/// Turn a device label into something safe to use in a file name
pub fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(counter: u32) -> SensorSample {
        SensorSample {
            packet_counter: counter,
            sample_time_fine: 1000 * counter as u64,
            euler: Some([1.0, 2.0, 3.0]),
            quaternion: None,
            free_acc: Some([0.5, 0.25, 0.0]),
            acc: None,
            gyr: None,
        }
    }

    #[test]
    fn test_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let header = LogHeader {
            label: "left-wrist".into(),
            address: "D4:22:CD:00:00:01".into(),
            is_synced: true,
            measurement_mode: MeasurementMode::CompleteEuler,
        };
        let mut logger = Box::new(CsvSampleLogger::create(dir.path(), &header).unwrap());
        logger.write(&sample(1)).unwrap();
        logger.write(&sample(2)).unwrap();
        let path = logger.path().to_path_buf();
        assert_eq!(logger.close().unwrap(), 2);

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("left-wrist_"));
        assert!(name.ends_with(".csv"));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "# Tag: left-wrist");
        assert_eq!(lines[2], "# Synced: true");
        assert!(lines[4].starts_with("PacketCounter,SampleTimeFine,Euler_X"));
        assert_eq!(lines[5], "1,1000,1,2,3,,,,,0.5,0.25,0,,,,,,");
        assert_eq!(lines.len(), 7);
    }

    #[test]
    fn test_existing_log_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knee.csv");
        std::fs::write(&path, "1,1000\n").unwrap();
        let header = LogHeader {
            label: "knee".into(),
            address: "A".into(),
            is_synced: false,
            measurement_mode: MeasurementMode::CompleteEuler,
        };

        let err = CsvSampleLogger::create_at(path.clone(), &header)
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1,1000\n");
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("D4:22:CD"), "D4_22_CD");
        assert_eq!(sanitize_label("knee/left"), "knee_left");
    }
}
