//! Bearer token authentication and path-based authorization for `/api/v1`

use axum::{
    extract::{Request, State},
    http::{header, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use common::AppError;
use errors::HeraldError;

use super::Principal;
use crate::app_state::AppState;
use crate::config::{AccessRule, CasbinConfig};

pub const API_PREFIX: &str = "/api/v1/";

/// Paths under [`API_PREFIX`] reachable without a token
const PUBLIC_PATHS: [&str; 2] = ["/api/v1/auth/login", "/api/v1/auth/captcha"];

/// True when `path` must carry a bearer token
pub fn requires_auth(path: &str, casbin: &CasbinConfig) -> bool {
    if !path.starts_with(API_PREFIX) {
        return false;
    }
    if PUBLIC_PATHS.iter().any(|p| path.starts_with(p)) {
        return false;
    }
    !casbin
        .ignore_path_prefixes
        .iter()
        .any(|prefix| !prefix.is_empty() && path.starts_with(prefix.as_str()))
}

/// Token from `Authorization: Bearer ...`
pub fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn rule_matches(rule: &AccessRule, method: &Method, path: &str) -> bool {
    path.starts_with(rule.path_prefix.as_str())
        && (rule.methods.is_empty()
            || rule
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.as_str())))
}

/// Every matching rule must list `username`; no matching rule allows
pub fn is_allowed(casbin: &CasbinConfig, method: &Method, path: &str, username: &str) -> bool {
    casbin
        .rules
        .iter()
        .filter(|rule| rule_matches(rule, method, path))
        .all(|rule| rule.users.iter().any(|u| u == username))
}

pub async fn bearer_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let casbin = &state.config.casbin;
    if !requires_auth(&path, casbin) {
        return next.run(req).await;
    }

    let Some(token) = bearer_token(&req) else {
        debug!(%path, "Missing bearer token");
        return AppError::from(HeraldError::Unauthorized("Missing token".to_string()))
            .into_response();
    };

    let claims = match state.auth.validate(token).await {
        Ok(claims) => claims,
        Err(e) => return AppError::from(e).into_response(),
    };

    if !is_allowed(casbin, req.method(), &path, &claims.username) {
        warn!(username = %claims.username, method = %req.method(), %path, "Access denied");
        return AppError::from(HeraldError::Forbidden(path)).into_response();
    }

    req.extensions_mut().insert(Principal::from(claims));
    next.run(req).await
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn casbin() -> CasbinConfig {
        CasbinConfig {
            ignore_path_prefixes: vec!["/api/v1/public".to_string()],
            rules: vec![AccessRule {
                path_prefix: "/api/v1/websocket/dict-change".to_string(),
                methods: vec!["POST".to_string()],
                users: vec!["admin".to_string()],
            }],
        }
    }

    #[test]
    fn test_requires_auth() {
        let casbin = casbin();
        assert!(requires_auth("/api/v1/notices", &casbin));
        assert!(!requires_auth("/api/v1/auth/login", &casbin));
        assert!(!requires_auth("/api/v1/auth/captcha/image", &casbin));
        assert!(!requires_auth("/api/v1/public/info", &casbin));
        assert!(!requires_auth("/ws", &casbin));
        assert!(!requires_auth("/health", &casbin));
        assert!(requires_auth("/api/v1/auth/logout", &casbin));
    }

    #[test]
    fn test_rules() {
        let casbin = casbin();
        let path = "/api/v1/websocket/dict-change";
        assert!(is_allowed(&casbin, &Method::POST, path, "admin"));
        assert!(!is_allowed(&casbin, &Method::POST, path, "alice"));
        // Method not covered by the rule
        assert!(is_allowed(&casbin, &Method::GET, path, "alice"));
        assert!(is_allowed(&casbin, &Method::POST, "/api/v1/notices", "alice"));
        assert!(is_allowed(&CasbinConfig::default(), &Method::POST, path, "alice"));
    }

    #[test]
    fn test_bearer_token() {
        let req = Request::builder()
            .header("Authorization", "Bearer abc")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&req), Some("abc"));

        let req = Request::builder()
            .header("Authorization", "Basic abc")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&req), None);
    }
}
