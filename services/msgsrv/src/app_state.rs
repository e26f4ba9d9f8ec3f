//! Application State Management
//!
//! Central state shared by HTTP handlers, middleware and the WebSocket loop

use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

use common::TimeProvider;

use crate::auth::{TokenAuthenticator, TokenCache};
use crate::broker::Broker;
use crate::config::AppConfig;
use crate::rate_limit::RateLimiter;
use crate::tx_scope::Database;
use crate::worker::{BackgroundWorker, WorkerHandle};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    /// Pool plus the request-transaction capability
    pub db: Database,

    pub auth: Arc<TokenAuthenticator>,

    /// Sessions, subscriptions and app handlers
    pub broker: Arc<Broker>,

    pub rate_limiter: Arc<RateLimiter>,

    /// Producer side of the background queue
    pub worker: WorkerHandle,

    pub clock: Arc<dyn TimeProvider>,
}

impl AppState {
    /// Build the state; the returned worker must be spawned by the caller
    pub fn new(
        config: AppConfig,
        pool: SqlitePool,
        cache: Arc<dyn TokenCache>,
        clock: Arc<dyn TimeProvider>,
    ) -> (Self, BackgroundWorker) {
        let auth = Arc::new(TokenAuthenticator::new(
            &config.name,
            config.auth.secret_key.as_deref(),
            config.auth.token_expired,
            cache,
            clock.clone(),
        ));
        let broker = Arc::new(Broker::new(auth.clone(), clock.clone(), &config.broker));
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit, clock.clone()));
        let db = Database::sqlite(pool, config.database.concurrent_write_transactions);
        let (worker, consumer) = BackgroundWorker::channel(config.worker.queue_capacity);

        info!(
            issuer = %config.name,
            request_transactions = db.supports_request_transactions(),
            rate_limit = config.rate_limit.enabled,
            "Application state initialized"
        );

        let state = Self {
            config: Arc::new(config),
            db,
            auth,
            broker,
            rate_limiter,
            worker,
            clock,
        };
        (state, consumer)
    }
}
