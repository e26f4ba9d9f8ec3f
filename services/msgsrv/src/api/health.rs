use axum::extract::State;
use serde::Serialize;

use common::success_response;

use super::ApiResult;
use crate::app_state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: &'static str,
    pub online_count: usize,
}

/// `GET /health`
pub async fn health_check(State(state): State<AppState>) -> ApiResult<HealthStatus> {
    Ok(success_response(HealthStatus {
        status: "ok",
        online_count: state.broker.online_count(),
    }))
}
