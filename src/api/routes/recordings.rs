use std::io;
use std::path::Path;

use axum::Json;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use serde::Serialize;

use crate::api::{ApiError, ApiState};
use crate::core::timestamp::to_rfc3339;
use crate::core::{RecordingsError, RecordingsResult};
use crate::recorder::list_recordings;

#[derive(Debug, Serialize)]
pub struct RecordingEntry {
    pub filename: String,
    pub size: u64,
    pub created: String,
    /// Download URL.
    pub path: String,
}

pub async fn list(State(state): State<ApiState>) -> Result<Json<Vec<RecordingEntry>>, ApiError> {
    let dir = state.recordings_dir.clone();
    let files = tokio::task::spawn_blocking(move || list_recordings(&dir))
        .await
        .map_err(|e| RecordingsError::Io(io::Error::other(e)))?
        .map_err(RecordingsError::from)?;

    let entries = files
        .into_iter()
        .map(|f| RecordingEntry {
            path: format!("/recordings/{}", f.filename),
            created: to_rfc3339(f.created),
            size: f.size,
            filename: f.filename,
        })
        .collect();
    Ok(Json(entries))
}

pub async fn remove(
    State(state): State<ApiState>,
    UrlPath(filename): UrlPath<String>,
) -> Result<StatusCode, ApiError> {
    delete_recording(&state.recordings_dir, &filename).await?;
    log::info!("[api] deleted recording {}", filename);
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_recording(dir: &Path, filename: &str) -> RecordingsResult<()> {
    if !is_plain_file_name(filename) {
        return Err(RecordingsError::invalid_name(filename));
    }
    match tokio::fs::remove_file(dir.join(filename)).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(RecordingsError::not_found(filename))
        }
        Err(err) => Err(err.into()),
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}
