//! Login and logout

use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::{success_response, ApiResponse};
use errors::HeraldError;

use super::ApiResult;
use crate::app_state::AppState;
use crate::auth::password::verify_password;
use crate::auth::UserIdentity;
use crate::schema::USER_STATUS_ENABLED;
use crate::tx_scope::RequestContext;

pub const TOKEN_TYPE: &str = "Bearer";

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResult {
    pub access_token: String,
    pub token_type: String,
    /// Seconds
    pub expires_in: u64,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    password: String,
    status: i64,
}

/// `POST /api/v1/auth/login`
pub async fn login(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<LoginRequest>,
) -> ApiResult<LoginResult> {
    let username = req.username.trim().to_string();
    if username.is_empty() || req.password.is_empty() {
        return Err(HeraldError::BadCredentials.into());
    }

    let lookup = username.clone();
    let user: Option<UserRow> = ctx
        .with_conn(|conn| {
            Box::pin(async move {
                let row = sqlx::query_as::<_, UserRow>(
                    "SELECT id, password, status FROM sys_user WHERE username = ?",
                )
                .bind(lookup)
                .fetch_optional(&mut *conn)
                .await?;
                Ok::<_, HeraldError>(row)
            })
        })
        .await?;

    let Some(user) = user else {
        warn!(%username, "Login failed: unknown user");
        return Err(HeraldError::BadCredentials.into());
    };
    // Argon2 is CPU-bound; keep it off the request workers
    let stored_hash = user.password.clone();
    let password = req.password;
    let verified = tokio::task::spawn_blocking(move || verify_password(&stored_hash, &password))
        .await
        .map_err(|e| HeraldError::Internal(format!("Password check aborted: {}", e)))??;
    if !verified {
        warn!(%username, "Login failed: wrong password");
        return Err(HeraldError::BadCredentials.into());
    }
    if user.status != USER_STATUS_ENABLED {
        warn!(%username, "Login failed: account disabled");
        return Err(HeraldError::Unauthorized("Account disabled".to_string()).into());
    }

    let issued = state
        .auth
        .issue(&UserIdentity {
            id: u64::try_from(user.id).unwrap_or_default(),
            username: username.clone(),
        })
        .await?;

    info!(%username, "User logged in");
    Ok(success_response(LoginResult {
        access_token: issued.token,
        token_type: TOKEN_TYPE.to_string(),
        expires_in: issued.expires_in,
    }))
}

/// `DELETE /api/v1/auth/logout`
pub async fn logout(State(state): State<AppState>, ctx: RequestContext) -> ApiResult<()> {
    let principal = ctx.require_principal()?;
    state.auth.revoke(&principal.username).await?;
    info!(username = %principal.username, "User logged out");
    Ok(Json(ApiResponse::empty()))
}
