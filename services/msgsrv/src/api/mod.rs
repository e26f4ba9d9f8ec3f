//! HTTP handlers
//!
//! Every handler answers with the [`common::ApiResponse`] envelope; failures
//! go through [`common::AppError`].

pub mod access_log;
pub mod auth;
pub mod health;
pub mod notice;
pub mod websocket;

use axum::response::Json;

use common::{ApiResponse, AppError};

/// Handler result carrying an envelope
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, AppError>;
