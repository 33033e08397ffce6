use std::time::SystemTime;

use chrono::{DateTime, Local, Utc};

pub const RECORDING_PREFIX: &str = "recording-";
pub const RECORDING_EXTENSION: &str = "mp4";

/// Sortable file name for a segment started at `at`,
/// e.g. `recording-20240131-235959.mp4`.
pub fn recording_file_name(at: DateTime<Local>) -> String {
    format!(
        "{}{}.{}",
        RECORDING_PREFIX,
        at.format("%Y%m%d-%H%M%S"),
        RECORDING_EXTENSION
    )
}

pub fn is_recording_file_name(name: &str) -> bool {
    name.starts_with(RECORDING_PREFIX)
        && name
            .rsplit_once('.')
            .is_some_and(|(stem, ext)| !stem.is_empty() && ext == RECORDING_EXTENSION)
}

pub fn to_rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339()
}
