//! Scanner configuration
//!
//! Configuration management using Figment.
//!
//! # Configuration Sources
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `IMMERSION_`
//! 2. TOML configuration file (default: `config/scanner.toml`)
//! 3. Built-in defaults matching the reference instrument
//!
//! # Example
//!
//! ```no_run
//! use immersion_scanner::config::ScannerConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ScannerConfig::load_from("config/scanner.toml")?;
//!     println!("Log level: {}", config.application.log_level);
//!     println!("Transport: {:?}", config.transport.kind);
//!     Ok(())
//! }
//! ```

pub mod scanner_config;

pub use scanner_config::{
    ApplicationConfig, CalibrationConfig, ConfigError, FilterConfig, MqttConfig, ScannerConfig,
    SerialConfig, SimulationConfig, TimingConfig, TransportConfig, TransportKind,
    DEFAULT_CONFIG_PATH, ENV_PREFIX,
};
