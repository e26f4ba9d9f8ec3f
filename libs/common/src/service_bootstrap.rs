//! Unified service bootstrap utilities
//!
//! Startup banner and logging initialization shared by herald services.

use crate::logging::{self, LogConfig};
use std::path::PathBuf;
use tracing::{info, Level};

/// Service metadata for startup
pub struct ServiceInfo {
    /// Service name (e.g., "msgsrv")
    pub name: String,
    /// Service version from Cargo.toml
    pub version: String,
    /// Service description
    pub description: String,
    /// Default port
    pub default_port: u16,
}

impl ServiceInfo {
    /// Create new service info
    pub fn new(name: impl Into<String>, description: impl Into<String>, default_port: u16) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: description.into(),
            default_port,
        }
    }
}

/// Print unified startup banner for any service
pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = r#"
 ██╗  ██╗███████╗██████╗  █████╗ ██╗     ██████╗
 ██║  ██║██╔════╝██╔══██╗██╔══██╗██║     ██╔══██╗
 ███████║█████╗  ██████╔╝███████║██║     ██║  ██║
 ██╔══██║██╔══╝  ██╔══██╗██╔══██║██║     ██║  ██║
 ██║  ██║███████╗██║  ██║██║  ██║███████╗██████╔╝
 ╚═╝  ╚═╝╚══════╝╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝╚═════╝
"#;

    info!("{}", banner);
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!(" Default Port: {}", service.default_port);
    info!("");
}

/// Logging options collected from configuration and CLI
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Level name (trace, debug, info, warn, error)
    pub level: Option<String>,
    /// Directory for log files; `None` keeps the default `logs`
    pub dir: Option<String>,
    pub json: bool,
    pub no_color: bool,
}

/// Initialize logging for a service with standard configuration
///
/// Log directory priority: `HERALD_LOG_DIR` environment variable, then
/// `options.dir`, then `logs`. Files go to a per-service subdirectory.
pub fn init_logging(service: &ServiceInfo, options: &LoggingOptions) -> anyhow::Result<()> {
    let level = options
        .level
        .as_deref()
        .and_then(|s| s.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    let root = std::env::var("HERALD_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            options
                .dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs"))
        });

    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir: Some(root.join(&service.name)),
        level,
        enable_json: options.json,
        ansi: !options.no_color,
        enable_api_log: true,
    };

    logging::init_with_config(log_config).map_err(|e| anyhow::anyhow!("{}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_info_creation() {
        let service = ServiceInfo::new("msgsrv", "Messaging Service", 6010);
        assert_eq!(service.name, "msgsrv");
        assert_eq!(service.description, "Messaging Service");
        assert_eq!(service.default_port, 6010);
        assert!(!service.version.is_empty());
    }
}
