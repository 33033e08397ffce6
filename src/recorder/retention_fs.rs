// src/recorder/retention_fs.rs
use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::core::timestamp::is_recording_file_name;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingFile {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
    pub created: SystemTime,
}

fn newest_first(a: &RecordingFile, b: &RecordingFile) -> Ordering {
    b.created
        .cmp(&a.created)
        .then_with(|| b.filename.cmp(&a.filename))
}

/// Recording files in `dir`, newest first. A missing directory is empty.
pub fn list_recordings(dir: &Path) -> io::Result<Vec<RecordingFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) if is_recording_file_name(n) => n.to_string(),
            _ => continue,
        };

        // Raced with a delete.
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }

        // Not every filesystem records a birth time.
        let created = meta
            .created()
            .or_else(|_| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        files.push(RecordingFile {
            filename: name,
            path,
            size: meta.len(),
            created,
        });
    }

    files.sort_by(newest_first);
    Ok(files)
}

/// Everything beyond the `max` newest files.
pub fn select_evictions(mut files: Vec<RecordingFile>, max: usize) -> Vec<RecordingFile> {
    files.sort_by(newest_first);
    if files.len() <= max {
        return Vec::new();
    }
    files.split_off(max)
}

/// Deletes the oldest recordings until at most `max` remain. The file
/// still being written (`active`) is never counted nor removed. Files
/// that vanish mid-sweep are ignored, so overlapping sweeps are harmless.
pub fn sweep_recordings(dir: &Path, max: usize, active: Option<&Path>) -> io::Result<usize> {
    let completed: Vec<RecordingFile> = list_recordings(dir)?
        .into_iter()
        .filter(|f| Some(f.path.as_path()) != active)
        .collect();

    let mut removed = 0;
    for file in select_evictions(completed, max) {
        match fs::remove_file(&file.path) {
            Ok(()) => {
                removed += 1;
                log::info!("[retention] removed {}", file.filename);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                log::warn!("[retention] failed {}: {}", file.filename, err);
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn file(name: &str, secs: u64) -> RecordingFile {
        RecordingFile {
            filename: name.to_string(),
            path: PathBuf::from(name),
            size: 0,
            created: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
        }
    }

    #[test]
    fn keeps_the_newest_n() {
        let files = vec![
            file("recording-c.mp4", 30),
            file("recording-a.mp4", 10),
            file("recording-e.mp4", 50),
            file("recording-b.mp4", 20),
            file("recording-d.mp4", 40),
        ];

        let evicted: Vec<String> = select_evictions(files, 3)
            .into_iter()
            .map(|f| f.filename)
            .collect();

        assert_eq!(evicted, vec!["recording-b.mp4", "recording-a.mp4"]);
    }

    #[test]
    fn nothing_to_evict_under_the_limit() {
        let files = vec![file("recording-a.mp4", 1), file("recording-b.mp4", 2)];
        assert!(select_evictions(files.clone(), 2).is_empty());
        assert!(select_evictions(files, 5).is_empty());
    }

    #[test]
    fn equal_times_fall_back_to_name_order() {
        let files = vec![
            file("recording-20240101-000001.mp4", 5),
            file("recording-20240101-000002.mp4", 5),
        ];
        let evicted = select_evictions(files, 1);
        assert_eq!(evicted[0].filename, "recording-20240101-000001.mp4");
    }

    #[test]
    fn missing_directory_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let files = list_recordings(&dir.path().join("nope")).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn sweep_deletes_oldest_files_and_spares_active_and_foreign() {
        let dir = tempfile::tempdir().unwrap();
        let names = [
            "recording-20240101-000001.mp4",
            "recording-20240101-000002.mp4",
            "recording-20240101-000003.mp4",
            "recording-20240101-000004.mp4",
            "recording-20240101-000005.mp4",
        ];
        for name in names {
            fs::write(dir.path().join(name), b"x").unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        fs::write(dir.path().join("notes.txt"), b"keep").unwrap();
        let active = dir.path().join(names[4]);

        let removed = sweep_recordings(dir.path(), 2, Some(&active)).unwrap();
        assert_eq!(removed, 2);

        let left: Vec<String> = list_recordings(dir.path())
            .unwrap()
            .into_iter()
            .map(|f| f.filename)
            .collect();
        assert_eq!(left, vec![names[4], names[3], names[2]]);
        assert!(dir.path().join("notes.txt").exists());

        // A second sweep is a no-op.
        assert_eq!(sweep_recordings(dir.path(), 2, Some(&active)).unwrap(), 0);
    }
}
