//! Common command-line arguments for homewatt binaries

use std::path::PathBuf;

use clap::Parser;

/// Common service startup arguments
#[derive(Debug, Clone, Parser)]
#[clap(author, version, about)]
pub struct ServiceArgs {
    /// Path to the YAML configuration file
    #[clap(
        short = 'c',
        long,
        default_value = "config/homewatt.yaml",
        env = "HOMEWATT_CONFIG"
    )]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[clap(short = 'l', long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Optional status listener override (e.g., 0.0.0.0:8080)
    #[clap(short = 'b', long, env = "HOMEWATT_STATUS_LISTEN")]
    pub status_listen: Option<String>,

    /// Directory for daily rolling log files
    #[clap(long, env = "HOMEWATT_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Emit JSON log lines
    #[clap(long)]
    pub json_logs: bool,

    /// Disable colored output (useful for log files)
    #[clap(long)]
    pub no_color: bool,

    /// Only validate configuration without starting service
    #[clap(long)]
    pub validate: bool,
}

impl Default for ServiceArgs {
    fn default() -> Self {
        Self {
            config: PathBuf::from("config/homewatt.yaml"),
            log_level: "info".to_string(),
            status_listen: None,
            log_dir: None,
            json_logs: false,
            no_color: false,
            validate: false,
        }
    }
}

impl ServiceArgs {
    /// Parse log level string to tracing::Level
    pub fn parse_log_level(&self) -> tracing::Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" | "warning" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }

    pub fn log_config(&self, service_name: &str) -> crate::logging::LogConfig {
        crate::logging::LogConfig {
            service_name: service_name.to_string(),
            level: self.parse_log_level(),
            log_dir: self.log_dir.clone(),
            enable_json: self.json_logs,
            ansi: !self.no_color,
        }
    }
}
