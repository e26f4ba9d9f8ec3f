//! Access log middleware: one `sys_log` job per authenticated request

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;

use crate::app_state::AppState;
use crate::auth::Principal;
use crate::rate_limit::client_key;
use crate::worker::{AccessLogEntry, Job};

/// Runs inside `bearer_auth`, so the principal is already attached
pub async fn access_log(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(principal) = req.extensions().get::<Principal>().cloned() else {
        return next.run(req).await;
    };

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_key(peer, req.headers());
    let start = Instant::now();

    let response = next.run(req).await;

    state.worker.submit(Job::AccessLog(AccessLogEntry {
        username: Some(principal.username),
        method,
        path,
        status: response.status().as_u16(),
        duration_ms: i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX),
        ip,
        create_time: state.clock.now_millis(),
    }));
    response
}
