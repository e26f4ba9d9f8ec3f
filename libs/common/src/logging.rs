//! Unified logging module for herald services
//!
//! Console output plus daily-rolling files. Events with target `api_access`
//! go to a separate `{service}_api` file so request logs do not drown the
//! business log.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter,
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Target used by the HTTP access logger
pub const API_ACCESS_TARGET: &str = "api_access";

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Service started`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the non-blocking writers flushing until process exit
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as the file prefix
    pub service_name: String,
    /// Base directory for log files; `None` disables file output
    pub log_dir: Option<PathBuf>,
    /// Default level when `RUST_LOG` is not set
    pub level: Level,
    /// Emit JSON lines in the business file
    pub enable_json: bool,
    /// Colored console output
    pub ansi: bool,
    /// Write `api_access` events to their own file
    pub enable_api_log: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "herald".to_string(),
            log_dir: Some(PathBuf::from("logs")),
            level: Level::INFO,
            enable_json: false,
            ansi: true,
            enable_api_log: true,
        }
    }
}

fn keep_guard(guard: WorkerGuard) {
    let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
    match guards.lock() {
        Ok(mut guards) => guards.push(guard),
        Err(poisoned) => poisoned.into_inner().push(guard),
    }
}

/// Build the filter: `RUST_LOG` wins, otherwise the configured level
fn build_filter(config: &LogConfig) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(env_str) if !env_str.trim().is_empty() => EnvFilter::new(env_str),
        _ => EnvFilter::new(format!(
            "{},{}={}",
            config.level.as_str().to_lowercase(),
            API_ACCESS_TARGET,
            config.level.as_str().to_lowercase()
        )),
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (business_file_layer, api_file_layer) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;

            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            keep_guard(guard);

            let business = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(true)
                    .with_filter(filter::filter_fn(|metadata| {
                        metadata.target() != API_ACCESS_TARGET
                    }))
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .with_filter(filter::filter_fn(|metadata| {
                        metadata.target() != API_ACCESS_TARGET
                    }))
                    .boxed()
            };

            let api = if config.enable_api_log {
                let appender = tracing_appender::rolling::daily(
                    dir,
                    format!("{}_api.log", config.service_name),
                );
                let (writer, guard) = tracing_appender::non_blocking(appender);
                keep_guard(guard);
                Some(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .event_format(BracketedLevelFormat)
                        .with_filter(filter::filter_fn(|metadata| {
                            metadata.target() == API_ACCESS_TARGET
                        }))
                        .boxed(),
                )
            } else {
                None
            };

            (Some(business), api)
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter(&config))
        .with(console_layer)
        .with(business_file_layer)
        .with(api_file_layer)
        .try_init()?;

    match &config.log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {:?}", config.service_name, dir),
        None => tracing::info!("Logging: {} (console only)", config.service_name),
    }

    Ok(())
}

/// Console-only logging at the given level
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = LogConfig {
        level: level.parse().unwrap_or(Level::INFO),
        log_dir: None,
        ..Default::default()
    };
    init_with_config(config)
}

/// Replace the value of sensitive keys in a JSON body
///
/// Keys containing password, token, secret, api_key or authorization
/// (case-insensitive) are replaced with `***REDACTED***`. Non-JSON input is
/// returned unchanged.
fn redact_sensitive_fields(json_str: &str) -> String {
    use serde_json::Value;

    const SENSITIVE_KEYS: &[&str] = &["password", "token", "api_key", "secret", "authorization"];

    let Ok(mut value) = serde_json::from_str::<Value>(json_str) else {
        return json_str.to_string();
    };

    fn redact_recursive(value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    if SENSITIVE_KEYS.iter().any(|&k| key_lower.contains(k)) {
                        *val = Value::String("***REDACTED***".to_string());
                    } else {
                        redact_recursive(val);
                    }
                }
            },
            Value::Array(arr) => {
                for item in arr.iter_mut() {
                    redact_recursive(item);
                }
            },
            _ => {},
        }
    }

    redact_recursive(&mut value);

    serde_json::to_string(&value).unwrap_or_else(|_| json_str.to_string())
}

/// Truncate body string to at most `max_length` bytes on a char boundary
fn truncate_body(body: &str, max_length: usize) -> String {
    if body.len() <= max_length {
        return body.to_string();
    }
    let mut cut = max_length;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}[truncated {} bytes]", &body[..cut], body.len() - cut)
}

/// HTTP API request logger middleware
///
/// - **INFO**: POST/PUT/PATCH/DELETE requests (no body)
/// - **DEBUG**: every request, JSON bodies included (redacted, truncated to 500 bytes)
///
/// Events use the `api_access` target so they land in the API log file.
///
/// ```rust,ignore
/// let app = Router::new()
///     // ... routes ...
///     .layer(middleware::from_fn(common::logging::http_request_logger));
/// ```
#[cfg(feature = "axum")]
pub async fn http_request_logger(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    use axum::body::Body;
    use std::time::Instant;
    use tracing::{debug, info, level_enabled};

    const MAX_BODY_LENGTH: usize = 500;

    let method = req.method().clone();
    let uri = req.uri().clone();
    let is_modifying = matches!(method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE");
    let content_type = req
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let start = Instant::now();

    let should_read_body =
        level_enabled!(Level::DEBUG) && is_modifying && content_type.contains("application/json");

    let (req, body_str) = if should_read_body {
        let (parts, body) = req.into_parts();
        let bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Failed to read request body: {}", e);
                let new_req = axum::extract::Request::from_parts(parts, Body::empty());
                return next.run(new_req).await;
            },
        };

        let body_str = match std::str::from_utf8(&bytes) {
            Ok(s) => truncate_body(&redact_sensitive_fields(s), MAX_BODY_LENGTH),
            Err(_) => "<binary data>".to_string(),
        };

        let new_req = axum::extract::Request::from_parts(parts, Body::from(bytes));
        (new_req, Some(body_str))
    } else {
        (req, None)
    };

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status();

    if is_modifying {
        info!(
            target: "api_access",
            method = %method,
            path = %uri.path(),
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "HTTP request"
        );
    }

    match body_str {
        Some(body) => debug!(
            target: "api_access",
            method = %method,
            path = %uri.path(),
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            request_body = %body,
            "HTTP request (detailed)"
        ),
        None if !is_modifying => debug!(
            target: "api_access",
            method = %method,
            path = %uri.path(),
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "HTTP request"
        ),
        None => {},
    }

    response
}
