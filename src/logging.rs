//! Tracing setup
//!
//! Installs a `tracing-subscriber` fmt layer driven by the scanner configuration.
//! `RUST_LOG` wins over `application.log_level` when it is set.
//!
//! ```no_run
//! use immersion_scanner::{config::ScannerConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ScannerConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(transport = ?config.transport.kind, "scanner starting");
//! # Ok(())
//! # }
//! ```

use crate::config::ScannerConfig;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable, coloured
    Pretty,
    /// One JSON object per event
    Json,
}

/// Resolved logging options
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Default level when `RUST_LOG` is absent
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_file_and_line: false,
        }
    }
}

impl LogSettings {
    /// Derive settings from the application section of the configuration.
    pub fn from_config(config: &ScannerConfig) -> Result<Self, String> {
        let level = parse_log_level(&config.application.log_level)?;
        let format = match config.application.log_format.as_str() {
            "json" => OutputFormat::Json,
            "pretty" => OutputFormat::Pretty,
            other => return Err(format!("Invalid log format '{}'", other)),
        };
        Ok(Self {
            level,
            format,
            ..Default::default()
        })
    }
}

/// Initialize tracing from the scanner configuration
pub fn init_from_config(config: &ScannerConfig) -> Result<(), String> {
    init(LogSettings::from_config(config)?)
}

/// Initialize tracing with explicit settings
///
/// Idempotent: a second call after a global subscriber is installed is a no-op.
/// The `Result` is kept for parity with [`init_from_config`].
pub fn init(settings: LogSettings) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str().to_lowercase()));

    let result = match settings.format {
        OutputFormat::Pretty => {
            let layer = fmt::layer()
                .with_target(false)
                .with_file(settings.with_file_and_line)
                .with_line_number(settings.with_file_and_line)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        OutputFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_file(settings.with_file_and_line)
                .with_line_number(settings.with_file_and_line)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
    };

    // try_init only fails when a global subscriber or logger already exists
    if let Err(e) = result {
        tracing::debug!("tracing already initialized: {}", e);
    }
    Ok(())
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("warn").unwrap(), Level::WARN);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = ScannerConfig::default();
        config.application.log_format = "json".to_string();
        let settings = LogSettings::from_config(&config).unwrap();
        assert_eq!(settings.format, OutputFormat::Json);
        assert_eq!(settings.level, Level::INFO);
    }
}
