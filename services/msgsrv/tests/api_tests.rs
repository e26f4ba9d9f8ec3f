//! HTTP API integration tests

#![allow(clippy::disallowed_methods)] // Integration test - unwrap is acceptable

use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;

use common::{success_response, ApiResponse, AppError};
use errors::HeraldError;
use msgsrv::config::AccessRule;
use msgsrv::routes::with_middleware;
use msgsrv::tx_scope::{install_panic_hook, RequestContext};

mod test_env;
use test_env::{request, TestEnv};

#[tokio::test]
async fn test_health_is_public() {
    let env = TestEnv::create().await;
    let (status, body) = env.request("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], "00000");
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["onlineCount"], 0);
}

#[tokio::test]
async fn test_login_returns_bearer_token() {
    let env = TestEnv::create().await;
    let (status, body) = env
        .request(
            "POST",
            "/api/v1/auth/login",
            None,
            Some(json!({"username": "admin", "password": "123456"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], "00000");
    assert_eq!(body["data"]["tokenType"], "Bearer");
    assert_eq!(body["data"]["expiresIn"], 7200);
    let token = body["data"]["accessToken"].as_str().unwrap();
    assert_eq!(env.state.auth.parse(token).unwrap().username, "admin");
}

#[tokio::test]
async fn test_login_rejects_bad_credentials() {
    let env = TestEnv::create().await;
    for (username, password) in [("admin", "wrong"), ("nobody", "123456")] {
        let (status, body) = env
            .request(
                "POST",
                "/api/v1/auth/login",
                None,
                Some(json!({"username": username, "password": password})),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "A0210");
    }
}

#[tokio::test]
async fn test_login_rejects_disabled_user() {
    let env = TestEnv::create().await;
    msgsrv::schema::create_user(env.sqlite.pool(), "carol", "secret", 0, env.now_millis())
        .await
        .unwrap();
    let (status, body) = env
        .request(
            "POST",
            "/api/v1/auth/login",
            None,
            Some(json!({"username": "carol", "password": "secret"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "A");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_logins_all_verify() {
    let env = TestEnv::create().await;
    env.create_user("dave", "pa55word").await;

    let attempts = [("admin", "123456"), ("dave", "pa55word"), ("admin", "123456"), ("dave", "nope")];
    let results = futures::future::join_all(attempts.iter().map(|(username, password)| {
        env.request(
            "POST",
            "/api/v1/auth/login",
            None,
            Some(json!({"username": username, "password": password})),
        )
    }))
    .await;

    let statuses: Vec<StatusCode> = results.iter().map(|(status, _)| *status).collect();
    assert_eq!(
        statuses,
        vec![
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::UNAUTHORIZED
        ]
    );
    assert_eq!(results[3].1["code"], "A0210");
}

#[tokio::test]
async fn test_protected_route_requires_token() {
    let env = TestEnv::create().await;

    let (status, body) = env
        .request("GET", "/api/v1/websocket/online-count", None, None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "A");

    let (status, body) = env
        .request("GET", "/api/v1/websocket/online-count", Some("not-a-token"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "A0230");
}

#[tokio::test]
async fn test_ignored_prefix_skips_auth() {
    let env = TestEnv::with_config(|c| {
        c.casbin.ignore_path_prefixes = vec!["/api/v1/websocket/online".to_string()];
    })
    .await;
    let (status, body) = env
        .request("GET", "/api/v1/websocket/online-count", None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], 0);
}

#[tokio::test]
async fn test_logout_revokes_tokens() {
    let env = TestEnv::create().await;
    let token = env.login("admin", "123456").await;

    let (status, _) = env
        .request("GET", "/api/v1/websocket/online-count", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = env
        .request("DELETE", "/api/v1/auth/logout", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], "00000");

    let (status, body) = env
        .request("GET", "/api/v1/websocket/online-count", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "A0230");
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let env = TestEnv::with_config(|c| c.auth.token_expired = 60).await;
    let token = env.token_for("admin").await;
    env.clock.advance_millis(61_000);

    let (status, body) = env
        .request("GET", "/api/v1/websocket/online-users", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "A0230");
}

#[tokio::test]
async fn test_rate_limit_burst_then_429() {
    let env = TestEnv::create().await;

    for i in 0..20 {
        let (status, _) = env.request("GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK, "request {} should pass", i);
    }
    for _ in 0..10 {
        let (status, body) = env.request("GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body, json!({"code": "A", "message": "Too many requests"}));
    }

    // 100 ms refills one token at 10/s
    env.clock.advance_millis(100);
    let (status, _) = env.request("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_access_rule_forbids_unlisted_user() {
    let env = TestEnv::with_config(|c| {
        c.casbin.rules = vec![AccessRule {
            path_prefix: "/api/v1/websocket/dict-change".to_string(),
            methods: vec!["POST".to_string()],
            users: vec!["admin".to_string()],
        }];
    })
    .await;
    let alice = env.token_for("alice").await;
    let admin = env.token_for("admin").await;
    let body = json!({"dictCode": "gender"});

    let (status, response) = env
        .request("POST", "/api/v1/websocket/dict-change", Some(&alice), Some(body.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(response["code"], "A");

    let (status, _) = env
        .request("POST", "/api/v1/websocket/dict-change", Some(&admin), Some(body))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_online_users_lists_connected_sessions() {
    let env = TestEnv::create().await;
    let _alice = env.connect("alice").await;
    env.clock.advance_millis(10);
    let _bob = env.connect("bob").await;
    let _bob_again = env.connect("bob").await;
    let token = env.token_for("admin").await;

    let (status, body) = env
        .request("GET", "/api/v1/websocket/online-users", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let users = body["data"].as_array().unwrap();
    assert_eq!(users.len(), 3);
    assert_eq!(users[0]["username"], "alice");

    let (_, body) = env
        .request("GET", "/api/v1/websocket/online-count", Some(&token), None)
        .await;
    assert_eq!(body["data"], 2);

    let (_, body) = env.request("GET", "/health", None, None).await;
    assert_eq!(body["data"]["onlineCount"], 2);
}

#[tokio::test]
async fn test_notices_are_stored_and_listed() {
    let env = TestEnv::create().await;
    let token = env.token_for("admin").await;

    for title in ["first", "second", "third"] {
        let (status, body) = env
            .request(
                "POST",
                "/api/v1/notices",
                Some(&token),
                Some(json!({"title": title, "content": "body", "targetType": 1})),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert!(body["data"].as_i64().unwrap() > 0);
    }

    let (status, body) = env
        .request("GET", "/api/v1/notices?pageNum=1&pageSize=2", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["page"], json!({"total": 3, "pageNum": 1, "pageSize": 2}));
    let notices = body["data"].as_array().unwrap();
    assert_eq!(notices.len(), 2);
    assert_eq!(notices[0]["title"], "third");
    assert_eq!(notices[0]["publisher"], "admin");
}

#[tokio::test]
async fn test_invalid_notice_is_rejected() {
    let env = TestEnv::create().await;
    let token = env.token_for("admin").await;
    let (status, body) = env
        .request(
            "POST",
            "/api/v1/notices",
            Some(&token),
            Some(json!({"title": "x", "content": "y", "targetType": 2})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "A");
}

#[tokio::test]
async fn test_notice_to_specified_users_is_pushed() {
    let env = TestEnv::create().await;
    let mut alice = env.connect("alice").await;
    env.subscribe(&alice, "m", "/user/queue/message").await;
    let mut bob = env.connect("bob").await;
    env.subscribe(&bob, "m", "/user/queue/message").await;
    let token = env.token_for("admin").await;

    let (status, _) = env
        .request(
            "POST",
            "/api/v1/notices",
            Some(&token),
            Some(json!({
                "title": "maintenance",
                "content": "tonight",
                "targetType": 2,
                "targetUsers": ["alice"]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let frame = alice.next_frame().await;
    assert!(frame.starts_with("MESSAGE\n"));
    assert!(frame.contains("destination:/user/alice/queue/message\n"));
    assert!(frame.contains("\"title\":\"maintenance\""));
    assert!(bob.is_idle());
}

#[tokio::test]
async fn test_authenticated_requests_are_access_logged() {
    let env = TestEnv::create().await;
    let token = env.token_for("admin").await;
    env.request("GET", "/api/v1/websocket/online-count", Some(&token), None)
        .await;
    // Unauthenticated requests are not logged
    env.request("GET", "/health", None, None).await;

    let count = env
        .wait_for_count(
            "SELECT COUNT(*) FROM sys_log WHERE username = 'admin' \
             AND path = '/api/v1/websocket/online-count' AND status = 200",
            1,
        )
        .await;
    assert_eq!(count, 1);
    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sys_log")
        .fetch_one(env.sqlite.pool())
        .await
        .unwrap();
    assert_eq!(total, 1);
}

// ============================================================================
// Request transaction scope
// ============================================================================

async fn insert_marker(ctx: &RequestContext, marker: &'static str) -> Result<(), HeraldError> {
    ctx.with_conn(|conn| {
        Box::pin(async move {
            sqlx::query("INSERT INTO tx_demo (marker) VALUES (?)")
                .bind(marker)
                .execute(&mut *conn)
                .await?;
            Ok::<_, HeraldError>(())
        })
    })
    .await
}

async fn write_then_panic(ctx: RequestContext) -> Json<ApiResponse<()>> {
    insert_marker(&ctx, "panic").await.unwrap();
    panic!("boom after write");
}

async fn write_then_fail(ctx: RequestContext) -> Result<Json<ApiResponse<()>>, AppError> {
    insert_marker(&ctx, "fail").await?;
    Err(HeraldError::BadRequest("rejected after write".to_string()).into())
}

async fn write_ok(ctx: RequestContext) -> Result<Json<ApiResponse<bool>>, AppError> {
    insert_marker(&ctx, "ok").await?;
    Ok(success_response(ctx.in_transaction()))
}

async fn transactional_env() -> (TestEnv, Router) {
    install_panic_hook();
    let env = TestEnv::with_config(|c| c.database.concurrent_write_transactions = Some(true)).await;
    sqlx::query("CREATE TABLE tx_demo (id INTEGER PRIMARY KEY AUTOINCREMENT, marker TEXT NOT NULL)")
        .execute(env.sqlite.pool())
        .await
        .unwrap();

    let routes = msgsrv::routes::api_routes()
        .route("/demo/panic", get(write_then_panic))
        .route("/demo/fail", get(write_then_fail))
        .route("/demo/ok", get(write_ok));
    let router = with_middleware(routes, &env.state).with_state(env.state.clone());
    (env, router)
}

async fn markers(env: &TestEnv) -> Vec<String> {
    sqlx::query_scalar("SELECT marker FROM tx_demo ORDER BY id")
        .fetch_all(env.sqlite.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_panic_rolls_back_and_server_survives() {
    let (env, router) = transactional_env().await;

    let (status, body) = request(&router, "GET", "/demo/panic", None, None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "B0001");
    assert!(markers(&env).await.is_empty());

    let (status, _) = request(&router, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_error_status_rolls_back() {
    let (env, router) = transactional_env().await;
    let (status, _) = request(&router, "GET", "/demo/fail", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(markers(&env).await.is_empty());
}

#[tokio::test]
async fn test_success_commits() {
    let (env, router) = transactional_env().await;
    let (status, body) = request(&router, "GET", "/demo/ok", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], true);
    assert_eq!(markers(&env).await, vec!["ok".to_string()]);
}

#[tokio::test]
async fn test_without_capability_requests_use_the_pool() {
    install_panic_hook();
    let env = TestEnv::create().await;
    assert!(!env.state.db.supports_request_transactions());
    sqlx::query("CREATE TABLE tx_demo (id INTEGER PRIMARY KEY AUTOINCREMENT, marker TEXT NOT NULL)")
        .execute(env.sqlite.pool())
        .await
        .unwrap();
    let routes = Router::new()
        .route("/demo/ok", get(write_ok))
        .route("/demo/panic", get(write_then_panic));
    let router = with_middleware(routes, &env.state).with_state(env.state.clone());

    let (status, body) = request(&router, "GET", "/demo/ok", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], false);

    // Panics are still recovered, but the write was not transactional
    let (status, _) = request(&router, "GET", "/demo/panic", None, None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(markers(&env).await, vec!["ok".to_string(), "panic".to_string()]);
}
