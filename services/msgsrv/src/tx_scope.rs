//! Request-scoped database transactions
//!
//! Every HTTP request except the WebSocket upgrade runs inside
//! [`transaction_scope`]. When the backend can take concurrent write
//! transactions, a transaction is begun before the handler and committed
//! only if the handler returns a status below 400 without panicking.
//! Handlers reach the database through [`RequestContext`], which carries
//! either that transaction or the plain pool.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::any::Any;
use std::cell::RefCell;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, warn};

use common::AppError;
use errors::{HeraldError, HeraldResult};

use crate::app_state::AppState;
use crate::auth::Principal;

/// Path of the WebSocket upgrade, never wrapped
pub const WS_PATH: &str = "/ws";

/// Bytes of backtrace kept per panic
const MAX_PANIC_TRACE: usize = 4096;

/// Pool plus the answer to "may requests hold write transactions?"
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    concurrent_write_transactions: bool,
}

impl Database {
    /// SQLite serialises writers, so request transactions are off unless
    /// explicitly enabled.
    pub const SQLITE_CONCURRENT_WRITES: bool = false;

    pub fn sqlite(pool: SqlitePool, concurrent_write_transactions: Option<bool>) -> Self {
        Self {
            pool,
            concurrent_write_transactions: concurrent_write_transactions
                .unwrap_or(Self::SQLITE_CONCURRENT_WRITES),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn supports_request_transactions(&self) -> bool {
        self.concurrent_write_transactions
    }
}

type SharedTransaction = Arc<tokio::sync::Mutex<Option<Transaction<'static, Sqlite>>>>;

/// Where a request's database work goes
#[derive(Clone)]
pub enum DbScope {
    Transaction(SharedTransaction),
    Pool(SqlitePool),
}

impl std::fmt::Debug for DbScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transaction(_) => f.write_str("DbScope::Transaction"),
            Self::Pool(_) => f.write_str("DbScope::Pool"),
        }
    }
}

/// Per-request context handed to handlers as an extractor
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub principal: Option<Principal>,
    pub db: DbScope,
}

impl RequestContext {
    /// The authenticated principal, or 401
    pub fn require_principal(&self) -> HeraldResult<&Principal> {
        self.principal
            .as_ref()
            .ok_or_else(|| HeraldError::Unauthorized("Authentication required".to_string()))
    }

    pub fn in_transaction(&self) -> bool {
        matches!(self.db, DbScope::Transaction(_))
    }

    /// Run `f` on the request's connection
    ///
    /// ```rust,ignore
    /// ctx.with_conn(|conn| Box::pin(async move {
    ///     sqlx::query("DELETE FROM sys_notice").execute(&mut *conn).await?;
    ///     Ok(())
    /// })).await?;
    /// ```
    pub async fn with_conn<T, F>(&self, f: F) -> HeraldResult<T>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, HeraldResult<T>>,
    {
        match &self.db {
            DbScope::Transaction(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or_else(|| {
                    HeraldError::Database("request transaction already finished".to_string())
                })?;
                f(&mut **tx).await
            },
            DbScope::Pool(pool) => {
                let mut conn = pool.acquire().await?;
                f(&mut *conn).await
            },
        }
    }
}

impl FromRequestParts<AppState> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let db = parts
            .extensions
            .get::<DbScope>()
            .cloned()
            .unwrap_or_else(|| DbScope::Pool(state.db.pool().clone()));
        let principal = parts.extensions.get::<Principal>().cloned();
        Ok(Self { principal, db })
    }
}

// ============================================================================
// Panic capture
// ============================================================================

thread_local! {
    static LAST_PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: OnceLock<()> = OnceLock::new();

/// Install (once) a panic hook that records a bounded backtrace for the
/// panicking thread, then defers to the previous hook
pub fn install_panic_hook() {
    PANIC_HOOK.get_or_init(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = std::backtrace::Backtrace::force_capture().to_string();
            LAST_PANIC_TRACE.with(|slot| {
                *slot.borrow_mut() = Some(truncate_trace(trace, MAX_PANIC_TRACE));
            });
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<String> {
    LAST_PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

fn truncate_trace(mut trace: String, max: usize) -> String {
    if trace.len() > max {
        let mut end = max;
        while !trace.is_char_boundary(end) {
            end -= 1;
        }
        trace.truncate(end);
    }
    trace
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// Middleware
// ============================================================================

async fn rollback(tx: Option<Transaction<'static, Sqlite>>, reason: &str) {
    if let Some(tx) = tx {
        match tx.rollback().await {
            Ok(()) => debug!(reason, "Request transaction rolled back"),
            Err(e) => warn!(reason, "Rollback failed: {}", e),
        }
    }
}

/// Wrap one request in a transaction and recover handler panics
pub async fn transaction_scope(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    if req.uri().path() == WS_PATH {
        return next.run(req).await;
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let shared: Option<SharedTransaction> = if state.db.supports_request_transactions() {
        match state.db.pool().begin().await {
            Ok(tx) => {
                let shared = Arc::new(tokio::sync::Mutex::new(Some(tx)));
                req.extensions_mut()
                    .insert(DbScope::Transaction(shared.clone()));
                Some(shared)
            },
            Err(e) => return AppError::from(HeraldError::Sqlite(e)).into_response(),
        }
    } else {
        None
    };

    let outcome = AssertUnwindSafe(next.run(req)).catch_unwind().await;

    let tx = match &shared {
        Some(shared) => shared.lock().await.take(),
        None => None,
    };

    match outcome {
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let trace = take_panic_trace().unwrap_or_default();
            error!(%method, %path, "Handler panicked: {}\n{}", message, trace);
            rollback(tx, "panic").await;
            AppError::from(HeraldError::Panic(message)).into_response()
        },
        Ok(response) if response.status().as_u16() >= 400 => {
            rollback(tx, "error status").await;
            response
        },
        Ok(response) => {
            if let Some(tx) = tx {
                // The status is already decided; a failed commit is only logged
                if let Err(e) = tx.commit().await {
                    let err = HeraldError::CommitFailed(e.to_string());
                    error!(%method, %path, "{}", err);
                }
            }
            response
        },
    }
}
