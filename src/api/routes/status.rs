use axum::Json;
use axum::extract::State;

use crate::api::{ApiError, ApiState};
use crate::relay::RelayStatus;

pub async fn get_status(State(state): State<ApiState>) -> Result<Json<RelayStatus>, ApiError> {
    Ok(Json(state.relay.status().await?))
}
