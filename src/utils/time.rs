//! Timestamp formatting for log files and export directories

use chrono::{DateTime, Local};

/// Format used in file and directory names, e.g. `20240131_154502_017`
pub const FILE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";

/// Current local time as a file-name stamp
pub fn file_stamp() -> String {
    format_file_stamp(&Local::now())
}

pub fn format_file_stamp(time: &DateTime<Local>) -> String {
    time.format(FILE_STAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_stamp_has_millisecond_suffix() {
        let time = Local
            .with_ymd_and_hms(2024, 1, 31, 15, 45, 2)
            .single()
            .unwrap()
            + chrono::Duration::milliseconds(17);
        assert_eq!(format_file_stamp(&time), "20240131_154502_017");
    }
}
