//! msgsrv configuration
//!
//! Layered with figment: built-in defaults, then the YAML file, then
//! `MSGSRV_`-prefixed environment variables (`__` separates nesting, e.g.
//! `MSGSRV_Auth__TokenExpired=3600`). Keys keep their PascalCase names.

use errors::{HeraldError, HeraldResult};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 6010;
/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "config/msgsrv.yaml";
/// Environment variable prefix
pub const ENV_PREFIX: &str = "MSGSRV_";

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AppConfig {
    /// Application name, also the token issuer
    pub name: String,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub casbin: CasbinConfig,
    pub database: DatabaseConfig,
    pub redis: RedisSection,
    pub rate_limit: RateLimitConfig,
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub log: LogSection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "herald".to_string(),
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            casbin: CasbinConfig::default(),
            database: DatabaseConfig::default(),
            redis: RedisSection::default(),
            rate_limit: RateLimitConfig::default(),
            broker: BrokerConfig::default(),
            worker: WorkerConfig::default(),
            log: LogSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuthConfig {
    /// Token lifetime in seconds
    pub token_expired: u64,
    /// Overrides the signing key derived from the issuer name
    pub secret_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_expired: 7200,
            secret_key: None,
        }
    }
}

/// Path-based access control
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CasbinConfig {
    /// URL prefixes that skip authentication
    pub ignore_path_prefixes: Vec<String>,
    /// Per-path user allow lists
    pub rules: Vec<AccessRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccessRule {
    pub path_prefix: String,
    /// Empty means every method
    #[serde(default)]
    pub methods: Vec<String>,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DatabaseConfig {
    pub path: String,
    /// Whether request-scoped write transactions are safe on this backend.
    /// Unset means "ask the backend": false for SQLite.
    pub concurrent_write_transactions: Option<bool>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/herald.db".to_string(),
            concurrent_write_transactions: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RedisSection {
    /// Token cache backend; unset keeps tokens in process memory
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub capacity: u32,
    pub refill_per_second: f64,
    /// Buckets idle this long are evicted
    pub idle_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 20,
            refill_per_second: 10.0,
            idle_seconds: 600,
            sweep_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BrokerConfig {
    /// Deadline for the first successful CONNECT
    pub connect_timeout_seconds: u64,
    /// Deadline for one outbound frame write
    pub write_timeout_millis: u64,
    pub max_frame_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: 10,
            write_timeout_millis: 5000,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WorkerConfig {
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LogSection {
    pub level: String,
    pub dir: Option<String>,
    pub json: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

impl AppConfig {
    /// Load defaults, then `path` (or the default file), then the environment
    pub fn load(path: Option<&Path>) -> HeraldResult<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__").lowercase(false))
            .extract()
            .map_err(|e| HeraldError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HeraldResult<()> {
        fn invalid(field: &str, reason: &str) -> HeraldError {
            HeraldError::InvalidConfig {
                field: field.to_string(),
                reason: reason.to_string(),
            }
        }

        if self.name.trim().is_empty() {
            return Err(invalid("Name", "must not be empty"));
        }
        if self.auth.token_expired == 0 {
            return Err(invalid("Auth.TokenExpired", "must be positive"));
        }
        if self.rate_limit.capacity == 0 {
            return Err(invalid("RateLimit.Capacity", "must be positive"));
        }
        if !(self.rate_limit.refill_per_second.is_finite() && self.rate_limit.refill_per_second > 0.0)
        {
            return Err(invalid("RateLimit.RefillPerSecond", "must be positive"));
        }
        if self.worker.queue_capacity == 0 {
            return Err(invalid("Worker.QueueCapacity", "must be positive"));
        }
        if self.broker.max_frame_bytes < 64 {
            return Err(invalid("Broker.MaxFrameBytes", "must be at least 64"));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
