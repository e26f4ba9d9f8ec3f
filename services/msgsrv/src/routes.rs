//! Router assembly
//!
//! Request path for API routes, outermost first:
//! request logger → rate limit → bearer auth → access log → transaction scope → handler.
//! `/ws` is merged after the layers so the upgrade never enters a transaction.

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::api::{access_log, auth, health, notice, websocket};
use crate::app_state::AppState;
use crate::tx_scope::{transaction_scope, WS_PATH};
use crate::ws::ws_handler;

/// API routes without middleware
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/auth/login", post(auth::login))
        .route("/api/v1/auth/logout", delete(auth::logout))
        .route("/api/v1/websocket/sendToAll", post(websocket::send_to_all))
        .route("/api/v1/websocket/sendToUser", post(websocket::send_to_user))
        .route("/api/v1/websocket/online-users", get(websocket::online_users))
        .route("/api/v1/websocket/online-count", get(websocket::online_count))
        .route("/api/v1/websocket/dict-change", post(websocket::dict_change))
        .route(
            "/api/v1/notices",
            get(notice::list_notices).post(notice::create_notice),
        )
}

/// Wrap `routes` in the standard middleware chain
pub fn with_middleware(routes: Router<AppState>, state: &AppState) -> Router<AppState> {
    routes
        .layer(from_fn_with_state(state.clone(), transaction_scope))
        .layer(from_fn_with_state(state.clone(), access_log::access_log))
        .layer(from_fn_with_state(
            state.clone(),
            crate::auth::middleware::bearer_auth,
        ))
        .layer(from_fn_with_state(state.clone(), crate::rate_limit::rate_limit))
        .layer(from_fn(common::logging::http_request_logger))
}

pub fn create_router(state: AppState) -> Router {
    with_middleware(api_routes(), &state)
        .route(WS_PATH, get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
