//! Shared API models for herald services
//!
//! Every HTTP handler answers with the same envelope:
//! `{ "code": "00000" | "A" | ..., "data"?, "page"?, "message" }`.

use errors::{HeraldError, CODE_SUCCESS};
use serde::{Deserialize, Serialize};

// ============================================================================
// Response envelope
// ============================================================================

/// Standard response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// `"00000"` on success, otherwise an error code
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<PageInfo>,
    pub message: String,
}

impl<T> ApiResponse<T> {
    /// Successful response carrying `data`
    pub fn ok(data: T) -> Self {
        Self {
            code: CODE_SUCCESS.to_string(),
            data: Some(data),
            page: None,
            message: "Success".to_string(),
        }
    }

    /// Successful response carrying one page of a listing
    pub fn ok_page(data: T, page: PageInfo) -> Self {
        Self {
            page: Some(page),
            ..Self::ok(data)
        }
    }

    /// Error response without data
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            data: None,
            page: None,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }
}

impl ApiResponse<()> {
    /// Successful response with no payload
    pub fn empty() -> Self {
        Self {
            code: CODE_SUCCESS.to_string(),
            data: None,
            page: None,
            message: "Success".to_string(),
        }
    }
}

/// Paging metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub total: u64,
    pub page_num: u32,
    pub page_size: u32,
}

/// Paging query parameters (`?pageNum=1&pageSize=10`)
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    #[serde(default = "default_page_num")]
    pub page_num: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_num() -> u32 {
    1
}

fn default_page_size() -> u32 {
    10
}

impl PageQuery {
    /// Maximum page size accepted from clients
    pub const MAX_PAGE_SIZE: u32 = 200;

    /// Clamped (limit, offset) pair for SQL
    pub fn limit_offset(&self) -> (i64, i64) {
        let size = self.page_size.clamp(1, Self::MAX_PAGE_SIZE);
        let num = self.page_num.max(1);
        (i64::from(size), i64::from(num - 1) * i64::from(size))
    }
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page_num: default_page_num(),
            page_size: default_page_size(),
        }
    }
}

// ============================================================================
// AppError - HTTP Error with proper status codes (requires axum feature)
// ============================================================================

#[cfg(feature = "axum")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};

/// Application error with HTTP status code
/// This type implements IntoResponse for seamless integration with axum handlers
#[cfg(feature = "axum")]
#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

#[cfg(feature = "axum")]
impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a 400 Bad Request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, errors::CODE_CLIENT_ERROR, message)
    }

    /// Create a 500 Internal Server Error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            errors::CODE_SERVER_ERROR,
            message,
        )
    }
}

#[cfg(feature = "axum")]
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiResponse::<()>::error(self.code, self.message)),
        )
            .into_response()
    }
}

#[cfg(feature = "axum")]
impl From<HeraldError> for AppError {
    fn from(err: HeraldError) -> Self {
        use errors::HeraldErrorTrait;

        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match err.log_level() {
            tracing::Level::ERROR => {
                tracing::error!(error_code = err.error_code(), "Request failed: {}", err)
            },
            tracing::Level::WARN => {
                tracing::warn!(error_code = err.error_code(), "Request failed: {}", err)
            },
            _ => tracing::debug!(error_code = err.error_code(), "Request failed: {}", err),
        }
        // Server-side details stay in the logs
        let message = if status.is_server_error() {
            "Internal server error".to_string()
        } else {
            err.to_string()
        };
        Self::new(status, err.envelope_code(), message)
    }
}

#[cfg(feature = "axum")]
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        HeraldError::Other(err).into()
    }
}

#[cfg(all(feature = "axum", feature = "sqlite"))]
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        HeraldError::Sqlite(err).into()
    }
}

/// Wrap data in a success envelope
#[cfg(feature = "axum")]
pub fn success_response<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse::ok(data))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let ok = serde_json::to_value(ApiResponse::ok(5)).unwrap();
        assert_eq!(ok["code"], "00000");
        assert_eq!(ok["data"], 5);
        assert!(ok.get("page").is_none());

        let err = serde_json::to_value(ApiResponse::<()>::error("A", "Too many requests")).unwrap();
        assert_eq!(
            err,
            serde_json::json!({"code": "A", "message": "Too many requests"})
        );
    }

    #[test]
    fn test_page_envelope() {
        let page = PageInfo {
            total: 42,
            page_num: 2,
            page_size: 10,
        };
        let value = serde_json::to_value(ApiResponse::ok_page(vec![1, 2], page)).unwrap();
        assert_eq!(value["page"]["pageNum"], 2);
        assert_eq!(value["page"]["total"], 42);
    }

    #[test]
    fn test_page_query_clamps() {
        let q = PageQuery {
            page_num: 0,
            page_size: 10_000,
        };
        assert_eq!(q.limit_offset(), (200, 0));
        let q = PageQuery {
            page_num: 3,
            page_size: 10,
        };
        assert_eq!(q.limit_offset(), (10, 20));
    }

    #[cfg(feature = "axum")]
    #[test]
    fn test_app_error_from_herald_error() {
        let err: AppError = HeraldError::RateLimitExceeded.into();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.code, "A");
        assert_eq!(err.message, "Too many requests");

        let err: AppError = HeraldError::Internal("secret detail".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Internal server error");
    }
}
