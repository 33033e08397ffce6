use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::Json;
use serde::Serialize;

use crate::api::{ApiError, ApiState};
use crate::config::{Config, ConfigPatch};

/// Config as the viewer UI sees it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigView {
    pub source_web_socket: String,
    #[serde(rename = "hostIP")]
    pub host_ip: String,
    pub port: u16,
    pub is_recording_enabled: bool,
    pub recording_interval: u64,
    pub max_recordings: usize,
}

impl From<&Config> for ConfigView {
    fn from(config: &Config) -> Self {
        Self {
            source_web_socket: config.source.url.clone(),
            host_ip: config.server.host_ip.clone(),
            port: config.server.port,
            is_recording_enabled: config.recording.enabled,
            recording_interval: config.recording.interval_minutes,
            max_recordings: config.recording.max_recordings,
        }
    }
}

pub async fn get_config(State(state): State<ApiState>) -> Result<Json<ConfigView>, ApiError> {
    let config = state.relay.config().await?;
    Ok(Json(ConfigView::from(&config)))
}

pub async fn post_config(
    State(state): State<ApiState>,
    payload: Result<Json<ConfigPatch>, JsonRejection>,
) -> Result<Json<ConfigView>, ApiError> {
    let Json(patch) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    log::info!("[api] config update: {:?}", patch);

    let config = state.relay.update_config(patch).await?;
    Ok(Json(ConfigView::from(&config)))
}
