//! Per-client token bucket rate limiting
//!
//! Buckets are created lazily per client address, refilled continuously at
//! `refill_per_second` up to `capacity`, and evicted by a background sweep
//! once idle for `idle_seconds`.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use common::{ApiResponse, TimeProvider};
use errors::HeraldError;

use crate::app_state::AppState;
use crate::config::RateLimitConfig;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill_ms: i64,
}

impl Bucket {
    fn full(capacity: f64, now_ms: i64) -> Self {
        Self {
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }

    fn try_take(&mut self, capacity: f64, rate_per_second: f64, now_ms: i64) -> bool {
        let elapsed = (now_ms - self.last_refill_ms).max(0);
        if elapsed > 0 {
            let refill = elapsed as f64 * rate_per_second / 1000.0;
            self.tokens = (self.tokens + refill).min(capacity);
            self.last_refill_ms = now_ms;
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token bucket table keyed by client address
pub struct RateLimiter {
    enabled: bool,
    capacity: f64,
    rate_per_second: f64,
    idle_ms: i64,
    buckets: DashMap<String, Mutex<Bucket>>,
    clock: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("enabled", &self.enabled)
            .field("capacity", &self.capacity)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            enabled: config.enabled,
            capacity: f64::from(config.capacity),
            rate_per_second: config.refill_per_second,
            idle_ms: i64::try_from(config.idle_seconds.saturating_mul(1000)).unwrap_or(i64::MAX),
            buckets: DashMap::new(),
            clock,
        }
    }

    /// Take one token from `key`'s bucket
    pub fn allow(&self, key: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let now = self.clock.now_millis();

        // Fast path: shared shard lock, per-bucket mutex
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.lock().try_take(self.capacity, self.rate_per_second, now);
        }

        let entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(Bucket::full(self.capacity, now)));
        let mut bucket = entry.lock();
        bucket.try_take(self.capacity, self.rate_per_second, now)
    }

    /// Drop buckets untouched for longer than the idle window
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now - bucket.lock().last_refill_ms < self.idle_ms);
        before.saturating_sub(self.buckets.len())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `interval` until cancelled
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep_idle();
                        if removed > 0 {
                            debug!(removed, remaining = self.bucket_count(), "Idle rate-limit buckets evicted");
                        }
                    }
                }
            }
        })
    }
}

/// Client address: peer socket, then proxy headers
pub fn client_key(peer: Option<SocketAddr>, headers: &HeaderMap) -> String {
    if let Some(addr) = peer {
        return addr.ip().to_string();
    }
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    forwarded
        .or(real_ip)
        .unwrap_or("unknown")
        .to_string()
}

/// Rejects over-budget clients with 429
pub async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(peer, req.headers());

    if state.rate_limiter.allow(&key) {
        return next.run(req).await;
    }

    warn!(client = %key, path = %req.uri().path(), "Rate limit exceeded");
    let err = HeraldError::RateLimitExceeded;
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ApiResponse::<()>::error(err.envelope_code(), err.to_string())),
    )
        .into_response()
}
