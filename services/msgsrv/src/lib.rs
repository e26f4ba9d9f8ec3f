//! msgsrv - real-time notification and messaging service
//!
//! STOMP over WebSocket broker with token authentication, per-client rate
//! limiting and request-scoped database transactions for the HTTP API.

pub mod api;
pub mod app_state;
pub mod auth;
pub mod broker;
pub mod config;
pub mod rate_limit;
pub mod routes;
pub mod schema;
pub mod stomp;
pub mod tx_scope;
pub mod worker;
pub mod ws;

pub use app_state::AppState;
pub use config::AppConfig;
pub use routes::create_router;
