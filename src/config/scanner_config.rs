//! Scanner configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/scanner.toml` (base configuration)
//! 2. Environment variables (prefixed with `IMMERSION_`, sections split on `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! IMMERSION_APPLICATION__LOG_LEVEL=debug
//! IMMERSION_TRANSPORT__KIND=mqtt
//! IMMERSION_TRANSPORT__MQTT__BROKER=192.168.1.20
//! IMMERSION_FILTER__MAX_ATTEMPTS=4
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/scanner.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "IMMERSION_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not read or deserialize a source.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// Values parsed but are logically inconsistent.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level scanner configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Sensor and actuator calibration constants
    pub calibration: CalibrationConfig,
    /// Outlier rejection and averaging parameters
    pub filter: FilterConfig,
    /// Settle delays and transport deadlines
    pub timing: TimingConfig,
    /// Which link to open and how
    pub transport: TransportConfig,
    /// Parameters of the in-process instrument model
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "immersion-scanner".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Calibration constants for the buoyancy sensor and the linear axis
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Raw sensor counts produced by one gram of buoyant force
    pub sensitivity_per_gram: f64,
    /// Grams of displaced fluid per cubic volume unit (water: 1e6 g/m³)
    pub grams_per_cubic_unit: f64,
    /// Actuator steps per physical length unit
    pub steps_per_unit: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            sensitivity_per_gram: -12.72,
            grams_per_cubic_unit: 1_000_000.0,
            steps_per_unit: 200.0 / 0.00125,
        }
    }
}

impl CalibrationConfig {
    /// Raw counts per volume unit. Dividing a raw sample by this yields volume.
    pub fn sample_to_volume_factor(&self) -> f64 {
        self.sensitivity_per_gram * self.grams_per_cubic_unit
    }

    /// Calibration where one raw count equals one volume unit and one step
    /// equals one length unit.
    pub fn unity() -> Self {
        Self {
            sensitivity_per_gram: 1.0,
            grams_per_cubic_unit: 1.0,
            steps_per_unit: 1.0,
        }
    }
}

/// Outlier rejection and grouped averaging parameters, in raw sensor counts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Absolute deviation thresholds applied in order
    pub pass_thresholds: Vec<f64>,
    /// Consecutive samples per deviation group
    pub group_size: usize,
    /// Groups at or above this population standard deviation are discarded
    pub accepted_std_dev: f64,
    /// Requests below this sample count use a plain mean
    pub plain_mean_below: u32,
    /// Full measurements attempted before giving up on a layer
    pub max_attempts: u32,
    /// Linear backoff unit between attempts
    pub retry_backoff_ms: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            pass_thresholds: vec![400.0, 70.0, 40.0],
            group_size: 50,
            accepted_std_dev: 25.0,
            plain_mean_below: 50,
            max_attempts: 10,
            retry_backoff_ms: 250,
        }
    }
}

impl FilterConfig {
    /// Backoff before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Settle delays and transport deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait after every serial write
    pub send_settle_ms: u64,
    /// Receive timeout for ordinary replies
    pub receive_timeout_ms: u64,
    /// Wait after move, home and motor-on commands
    pub motion_settle_ms: u64,
    /// Wait after motor-off (braking is slower)
    pub motor_off_settle_ms: u64,
    /// Buffered capture: deadline for the first item
    pub buffer_first_item_ms: u64,
    /// Buffered capture: deadline for the terminator item
    pub buffer_terminator_ms: u64,
    /// Spacing between boot handshake polls
    pub boot_poll_ms: u64,
    /// Line prefix the instrument prints once its own setup is done
    pub ready_marker: String,
    /// Command prefix whose reply is awaited without a timeout
    pub long_query_prefix: String,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            send_settle_ms: 500,
            receive_timeout_ms: 5000,
            motion_settle_ms: 2000,
            motor_off_settle_ms: 10_000,
            buffer_first_item_ms: 2000,
            buffer_terminator_ms: 30_000,
            boot_poll_ms: 1000,
            ready_marker: "Instrument setup".to_string(),
            long_query_prefix: "MEAS:BUOY:VALS ".to_string(),
        }
    }
}

impl TimingConfig {
    /// Same timings with every delay set to zero, for simulations.
    pub fn immediate() -> Self {
        Self {
            send_settle_ms: 0,
            motion_settle_ms: 0,
            motor_off_settle_ms: 0,
            boot_poll_ms: 0,
            ..Self::default()
        }
    }

    pub(crate) fn send_settle(&self) -> Duration {
        Duration::from_millis(self.send_settle_ms)
    }

    pub(crate) fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub(crate) fn motion_settle(&self) -> Duration {
        Duration::from_millis(self.motion_settle_ms)
    }

    pub(crate) fn motor_off_settle(&self) -> Duration {
        Duration::from_millis(self.motor_off_settle_ms)
    }

    pub(crate) fn buffer_first_item(&self) -> Duration {
        Duration::from_millis(self.buffer_first_item_ms)
    }

    pub(crate) fn buffer_terminator(&self) -> Duration {
        Duration::from_millis(self.buffer_terminator_ms)
    }

    pub(crate) fn boot_poll(&self) -> Duration {
        Duration::from_millis(self.boot_poll_ms)
    }
}

/// Link selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Synchronous request/response over a serial line
    #[default]
    Serial,
    /// Publish/subscribe through an MQTT broker
    Mqtt,
    /// In-process instrument model, no hardware
    Simulated,
}

/// Transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Active link kind
    pub kind: TransportKind,
    /// Serial line settings
    pub serial: SerialConfig,
    /// MQTT session settings
    pub mqtt: MqttConfig,
}

/// Serial line settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port (e.g., "/dev/ttyACM0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 9600,
        }
    }
}

/// MQTT session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host name or address
    pub broker: String,
    /// Broker port
    pub port: u16,
    /// Client identifier presented to the broker
    pub client_id: String,
    /// Topic the instrument listens on
    pub command_topic: String,
    /// Topic the instrument prints replies to
    pub reply_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            client_id: "immersion-scanner".to_string(),
            command_topic: "arduino/commands".to_string(),
            reply_topic: "arduino/prints".to_string(),
        }
    }
}

/// In-process instrument model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Radius of the simulated cylindrical object, in length units
    pub object_radius: f64,
    /// Peak-to-peak uniform sensor noise, in raw counts
    pub noise_counts: f64,
    /// Probability that a single sample is a gross outlier
    pub outlier_probability: f64,
    /// Offset added to an outlier sample, in raw counts
    pub outlier_counts: f64,
    /// Seed for the noise generator
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            object_radius: 0.02,
            noise_counts: 20.0,
            outlier_probability: 0.01,
            outlier_counts: 5000.0,
            seed: 7,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ScannerConfig {
    /// Load configuration from `config/scanner.toml` and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Precedence (highest first): environment, file, built-in defaults. A
    /// missing file is not an error; every field has a default.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        let calibration = &self.calibration;
        let factor = calibration.sample_to_volume_factor();
        if !factor.is_finite() || factor == 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "Calibration factor must be finite and non-zero, got {}",
                factor
            )));
        }
        if !calibration.steps_per_unit.is_finite() || calibration.steps_per_unit <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "steps_per_unit must be positive, got {}",
                calibration.steps_per_unit
            )));
        }

        let filter = &self.filter;
        if filter.pass_thresholds.iter().any(|t| !t.is_finite() || *t <= 0.0) {
            return Err(ConfigError::ValidationError(
                "pass_thresholds must all be positive".to_string(),
            ));
        }
        if filter.group_size == 0 {
            return Err(ConfigError::ValidationError(
                "group_size must be > 0".to_string(),
            ));
        }
        if filter.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "max_attempts must be > 0".to_string(),
            ));
        }

        if self.timing.long_query_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "long_query_prefix cannot be empty".to_string(),
            ));
        }

        match self.transport.kind {
            TransportKind::Serial => {
                if self.transport.serial.port.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "Serial transport: 'port' cannot be empty".to_string(),
                    ));
                }
            }
            TransportKind::Simulated => {
                let sim = &self.simulation;
                if !sim.object_radius.is_finite() || sim.object_radius < 0.0 {
                    return Err(ConfigError::ValidationError(format!(
                        "Simulation: object_radius must be >= 0, got {}",
                        sim.object_radius
                    )));
                }
                if !(0.0..=1.0).contains(&sim.outlier_probability) {
                    return Err(ConfigError::ValidationError(format!(
                        "Simulation: outlier_probability must be within 0..=1, got {}",
                        sim.outlier_probability
                    )));
                }
            }
            TransportKind::Mqtt => {
                let mqtt = &self.transport.mqtt;
                if mqtt.broker.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "MQTT transport: 'broker' cannot be empty".to_string(),
                    ));
                }
                if mqtt.command_topic == mqtt.reply_topic {
                    return Err(ConfigError::ValidationError(format!(
                        "MQTT transport: command and reply topics must differ (both '{}')",
                        mqtt.command_topic
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_match_instrument() {
        let config = ScannerConfig::default();
        assert!((config.calibration.sample_to_volume_factor() + 12_720_000.0).abs() < 1e-6);
        assert_eq!(config.calibration.steps_per_unit, 160_000.0);
        assert_eq!(config.filter.pass_thresholds, vec![400.0, 70.0, 40.0]);
        assert_eq!(config.timing.motor_off_settle_ms, 10_000);
        assert_eq!(config.transport.mqtt.command_topic, "arduino/commands");
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[transport]
kind = "mqtt"

[transport.mqtt]
broker = "10.0.0.5"
port = 1884

[filter]
max_attempts = 3
"#
        )
        .unwrap();

        let config = ScannerConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.transport.kind, TransportKind::Mqtt);
        assert_eq!(config.transport.mqtt.broker, "10.0.0.5");
        assert_eq!(config.transport.mqtt.port, 1884);
        assert_eq!(config.transport.mqtt.reply_topic, "arduino/prints");
        assert_eq!(config.filter.max_attempts, 3);
        assert_eq!(config.filter.group_size, 50);
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScannerConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.transport.kind, TransportKind::Serial);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("IMMERSION_FILTER__GROUP_SIZE", "20");
        let dir = tempfile::tempdir().unwrap();
        let result = ScannerConfig::load_from(dir.path().join("absent.toml"));
        std::env::remove_var("IMMERSION_FILTER__GROUP_SIZE");
        assert_eq!(result.unwrap().filter.group_size, 20);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = ScannerConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_zero_calibration_rejected() {
        let mut config = ScannerConfig::default();
        config.calibration.sensitivity_per_gram = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mqtt_topics_must_differ() {
        let mut config = ScannerConfig::default();
        config.transport.kind = TransportKind::Mqtt;
        config.transport.mqtt.reply_topic = config.transport.mqtt.command_topic.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_linear() {
        let filter = FilterConfig::default();
        assert_eq!(filter.backoff(0), Duration::ZERO);
        assert_eq!(filter.backoff(3), Duration::from_millis(750));
    }
}
