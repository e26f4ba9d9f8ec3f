//! Shared test scaffolding for msgsrv integration tests
//!
//! A `TestEnv` owns a temporary SQLite file, an in-memory token cache, a
//! manual clock and a router built exactly like the production one.

#![allow(clippy::disallowed_methods)] // Integration test - unwrap is acceptable
#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::util::ServiceExt;

use common::sqlite::SqliteClient;
use common::{ManualTimeProvider, TimeProvider};
use msgsrv::auth::{MemoryTokenCache, TokenCache, UserIdentity};
use msgsrv::broker::{ChannelSink, Flow, SessionId};
use msgsrv::config::AppConfig;
use msgsrv::stomp::{Command, Frame};
use msgsrv::{create_router, schema, AppState};

pub const START_MILLIS: i64 = 1_700_000_000_000;

/// Test environment context containing all required resources
pub struct TestEnv {
    pub state: AppState,
    pub router: Router,
    pub clock: Arc<ManualTimeProvider>,
    pub sqlite: SqliteClient,
    pub shutdown: CancellationToken,
    pub temp_dir: TempDir,
}

impl TestEnv {
    /// Default configuration
    pub async fn create() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Configuration adjusted by `configure` before the state is built
    pub async fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("test_herald.db");
        let sqlite = SqliteClient::new(&db_path).await.unwrap();
        schema::init_schema(sqlite.pool()).await.unwrap();
        schema::seed_admin(sqlite.pool(), START_MILLIS).await.unwrap();

        let mut config = AppConfig::default();
        config.database.path = db_path.display().to_string();
        configure(&mut config);

        let clock = Arc::new(ManualTimeProvider::new(START_MILLIS));
        let cache: Arc<dyn TokenCache> = Arc::new(MemoryTokenCache::new(clock.clone()));
        let (state, consumer) =
            AppState::new(config, sqlite.pool().clone(), cache, clock.clone());

        let shutdown = CancellationToken::new();
        consumer.spawn(
            sqlite.pool().clone(),
            state.broker.clone(),
            shutdown.clone(),
        );

        let router = create_router(state.clone());
        Self {
            state,
            router,
            clock,
            sqlite,
            shutdown,
            temp_dir,
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Add an enabled user with `password`
    pub async fn create_user(&self, username: &str, password: &str) {
        schema::create_user(
            self.sqlite.pool(),
            username,
            password,
            schema::USER_STATUS_ENABLED,
            START_MILLIS,
        )
        .await
        .unwrap();
    }

    /// Token issued directly, bypassing the login endpoint
    pub async fn token_for(&self, username: &str) -> String {
        self.state
            .auth
            .issue(&UserIdentity {
                id: 1,
                username: username.to_string(),
            })
            .await
            .unwrap()
            .token
    }

    /// Token obtained through `POST /api/v1/auth/login`
    pub async fn login(&self, username: &str, password: &str) -> String {
        let (status, body) = self
            .request(
                "POST",
                "/api/v1/auth/login",
                None,
                Some(json!({"username": username, "password": password})),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "login failed: {}", body);
        body["data"]["accessToken"].as_str().unwrap().to_string()
    }

    /// JSON request through the full middleware chain
    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        request(&self.router, method, uri, token, body).await
    }

    /// Register an in-process session and complete CONNECT for `username`
    pub async fn connect(&self, username: &str) -> StompClient {
        let token = self.token_for(username).await;
        let (sink, rx) = ChannelSink::new();
        let session_id = self.state.broker.open_session(Box::new(sink)).id();
        let mut client = StompClient { session_id, rx };
        let connect = Frame::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("passcode", token);
        assert_eq!(
            self.state.broker.handle_frame(session_id, connect).await,
            Flow::Continue
        );
        let connected = client.next_frame().await;
        assert!(connected.starts_with("CONNECTED\n"), "{}", connected);
        client
    }

    /// Send a client frame on behalf of `client`
    pub async fn send_frame(&self, client: &StompClient, frame: Frame) -> Flow {
        self.state.broker.handle_frame(client.session_id, frame).await
    }

    pub async fn subscribe(&self, client: &StompClient, sub_id: &str, destination: &str) {
        let frame = Frame::new(Command::Subscribe)
            .with_header("id", sub_id)
            .with_header("destination", destination);
        assert_eq!(self.send_frame(client, frame).await, Flow::Continue);
    }

    /// Poll `sql` (a single COUNT) until it returns at least `expected`
    pub async fn wait_for_count(&self, sql: &str, expected: i64) -> i64 {
        let mut count = 0;
        for _ in 0..50 {
            let (n,): (i64,) = sqlx::query_as(sql)
                .fetch_one(self.sqlite.pool())
                .await
                .unwrap();
            count = n;
            if count >= expected {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        count
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Frames written to an in-process session
pub struct StompClient {
    pub session_id: SessionId,
    pub rx: mpsc::UnboundedReceiver<Bytes>,
}

impl StompClient {
    pub async fn next_frame(&mut self) -> String {
        let bytes = tokio::time::timeout(std::time::Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("session sink closed");
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// True when nothing is queued for this client
    pub fn is_idle(&mut self) -> bool {
        matches!(
            self.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected)
        )
    }
}

/// Send a JSON request to `app` and decode the envelope
pub async fn request(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(json) => builder
            .body(Body::from(serde_json::to_string(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = if body_bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body_bytes).unwrap()
    };
    (status, body)
}
