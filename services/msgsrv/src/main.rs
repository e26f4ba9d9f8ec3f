//! Messaging Service (msgsrv)
//!
//! HTTP API plus a STOMP-over-WebSocket broker for real-time notifications.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common::redis::RedisClient;
use common::service_bootstrap::{init_logging, print_startup_banner, LoggingOptions, ServiceInfo};
use common::sqlite::SqliteClient;
use common::{SystemTimeProvider, TimeProvider};

use msgsrv::auth::{MemoryTokenCache, RedisTokenCache, TokenCache};
use msgsrv::config::{AppConfig, DEFAULT_PORT};
use msgsrv::{create_router, schema, tx_scope, AppState};

#[derive(Parser, Debug, Clone)]
#[command(name = "msgsrv", version, about = "Real-time messaging service")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long, env = "MSGSRV_CONFIG")]
    config: Option<PathBuf>,

    /// Override Server.Host/Port, e.g. 0.0.0.0:6010
    #[arg(long)]
    bind_address: Option<String>,

    /// Override Database.Path
    #[arg(long)]
    db_path: Option<String>,

    /// Override Redis.Url
    #[arg(long)]
    redis_url: Option<String>,

    /// Override Log.Level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Disable colored output and the banner
    #[arg(long)]
    no_color: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(path) = &args.db_path {
        config.database.path = path.clone();
    }
    if let Some(url) = &args.redis_url {
        config.redis.url = Some(url.clone());
    }
    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }

    let service_info = ServiceInfo::new(
        "msgsrv",
        "Real-time Notification Service - STOMP over WebSocket",
        DEFAULT_PORT,
    );
    init_logging(
        &service_info,
        &LoggingOptions {
            level: Some(config.log.level.clone()),
            dir: config.log.dir.clone(),
            json: config.log.json,
            no_color: args.no_color,
        },
    )?;
    if !args.no_color {
        print_startup_banner(&service_info);
    }

    tx_scope::install_panic_hook();

    let clock: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);

    // Database
    let sqlite = SqliteClient::new(&config.database.path).await?;
    schema::init_schema(sqlite.pool()).await?;
    schema::seed_admin(sqlite.pool(), clock.now_millis()).await?;

    // Token cache
    let cache: Arc<dyn TokenCache> = match &config.redis.url {
        Some(url) => {
            let client = RedisClient::new(url)
                .await
                .with_context(|| format!("Failed to connect to Redis at {}", url))?;
            info!("Token cache: Redis at {}", url);
            Arc::new(RedisTokenCache::new(client))
        },
        None => {
            warn!("Redis.Url not set, tokens are cached in process memory");
            Arc::new(MemoryTokenCache::new(clock.clone()))
        },
    };

    let bind_address = args
        .bind_address
        .clone()
        .unwrap_or_else(|| config.bind_address());
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", bind_address))?;

    let sweep_interval = Duration::from_secs(config.rate_limit.sweep_interval_seconds.max(1));
    let (state, consumer) = AppState::new(config, sqlite.pool().clone(), cache, clock);

    // Background tasks
    let shutdown_token = CancellationToken::new();
    let worker_handle = consumer.spawn(
        sqlite.pool().clone(),
        state.broker.clone(),
        shutdown_token.clone(),
    );
    let sweeper_handle = state
        .rate_limiter
        .clone()
        .spawn_sweeper(sweep_interval, shutdown_token.clone());

    let broker = state.broker.clone();
    let app = create_router(state);

    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()
    } else {
        tokio::net::TcpSocket::new_v6()
    }
    .context("Failed to create socket")?;
    socket
        .set_reuseaddr(true)
        .context("Failed to set SO_REUSEADDR")?;
    socket
        .bind(addr)
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let listener = socket.listen(1024).context("Failed to listen")?;

    info!("API server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let server_token = shutdown_token.clone();
    let server_handle = tokio::spawn(async move {
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_token.cancelled().await });
        if let Err(e) = server.await {
            error!("Server error: {}", e);
        }
    });

    common::shutdown::cancel_on_shutdown(shutdown_token.clone()).await;

    let closed = broker.close_all().await;
    info!(sessions = closed, "WebSocket sessions closed");
    for (name, handle) in [
        ("server", server_handle),
        ("worker", worker_handle),
        ("sweeper", sweeper_handle),
    ] {
        if let Err(e) = handle.await {
            error!("{} task failed: {}", name, e);
        }
    }

    info!("msgsrv stopped");
    Ok(())
}
