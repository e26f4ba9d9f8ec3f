//! Herald basic library
//!
//! Provides functions shared by herald services:
//! - response envelope and HTTP error mapping
//! - Redis and SQLite clients
//! - logging, bootstrap and shutdown helpers
//! - time providers

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub mod api_types;
pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;
pub mod time;

// Re-export commonly used API types
pub use api_types::{ApiResponse, PageInfo, PageQuery};

#[cfg(feature = "axum")]
pub use api_types::{success_response, AppError};

pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};

// Re-export common dependencies
pub use anyhow;
pub use serde_json;

// Pre-import common types
pub mod prelude {
    #[cfg(feature = "redis")]
    pub use crate::redis::RedisClient;
    #[cfg(feature = "sqlite")]
    pub use crate::sqlite::{SqliteClient, SqlitePool};
}
