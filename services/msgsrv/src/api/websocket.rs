//! Server-originated pub/sub endpoints under `/api/v1/websocket`

use axum::{extract::State, response::Json};
use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

use common::{success_response, ApiResponse};
use errors::HeraldError;

use super::ApiResult;
use crate::app_state::AppState;
use crate::broker::{OnlineUser, NOTICE_TOPIC};
use crate::tx_scope::RequestContext;

#[derive(Debug, Deserialize)]
pub struct SendToAllRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct SendToUserRequest {
    pub username: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DictChangeRequest {
    pub dict_code: String,
}

/// Message text as a JSON string body
fn string_body(message: &str) -> Result<Bytes, HeraldError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub async fn send_to_all(
    State(state): State<AppState>,
    Json(req): Json<SendToAllRequest>,
) -> ApiResult<()> {
    let delivered = state
        .broker
        .broadcast_topic(NOTICE_TOPIC, string_body(&req.message)?)
        .await;
    debug!(delivered, "Broadcast via HTTP");
    Ok(Json(ApiResponse::empty()))
}

pub async fn send_to_user(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<SendToUserRequest>,
) -> ApiResult<()> {
    let sender = ctx.require_principal()?;
    if req.username.trim().is_empty() {
        return Err(HeraldError::Validation("username must not be empty".to_string()).into());
    }
    state
        .broker
        .send_to_user(&sender.username, &req.username, string_body(&req.message)?)
        .await;
    Ok(Json(ApiResponse::empty()))
}

pub async fn online_users(State(state): State<AppState>) -> ApiResult<Vec<OnlineUser>> {
    Ok(success_response(state.broker.online_users()))
}

pub async fn online_count(State(state): State<AppState>) -> ApiResult<usize> {
    Ok(success_response(state.broker.online_count()))
}

pub async fn dict_change(
    State(state): State<AppState>,
    Json(req): Json<DictChangeRequest>,
) -> ApiResult<()> {
    if req.dict_code.trim().is_empty() {
        return Err(HeraldError::Validation("dictCode must not be empty".to_string()).into());
    }
    state.broker.broadcast_dict_change(&req.dict_code).await?;
    Ok(Json(ApiResponse::empty()))
}
