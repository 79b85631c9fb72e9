//! Scanner command protocol
//!
//! [`Scanner`] is the instrument-facing API: axis homing, motor power,
//! absolute moves and raw queries. Every operation is one `send` or `query`
//! on the active [`Transport`] followed, for motion and power commands, by a
//! fixed settle wait. The settle wait is not a completion acknowledgment;
//! the firmware never reports when motion has finished.
//!
//! ## Command Reference
//!
//! | Operation          | Command                  | Settle        |
//! |--------------------|--------------------------|---------------|
//! | `move_to`          | `OUTP:MOVE <steps>`      | motion (2 s)  |
//! | `set_axis_home`    | `CONT:CONF:AXIS:HOME`    | motion (2 s)  |
//! | `set_auto_home`    | `CONT:CONF:AXIS:AUHO`    | motion (2 s)  |
//! | `set_motor_on`     | `CONT:CONF:MOTR:ON`      | motion (2 s)  |
//! | `set_motor_off`    | `CONT:CONF:MOTR:OFF`     | braking (10 s)|
//! | `get_id`           | `*IDN?`                  | none          |
//! | `measure_buoyancy` | `MEAS:BUOY <n>`          | none          |

use crate::config::{CalibrationConfig, FilterConfig, ScannerConfig, TimingConfig};
use crate::error::{ScanResult, ScannerError};
use crate::transport::{self, strip_line_ending, Buffered, Transport};
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Motor power state as last commanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotorState {
    /// Coils energized; moves and homing take effect.
    On,
    /// Coils released.
    #[default]
    Off,
}

impl fmt::Display for MotorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotorState::On => write!(f, "on"),
            MotorState::Off => write!(f, "off"),
        }
    }
}

/// Immersion scanner bound to one transport for its whole lifetime
pub struct Scanner {
    transport: Box<dyn Transport>,
    pub(crate) calibration: CalibrationConfig,
    pub(crate) filter: FilterConfig,
    timing: TimingConfig,
    motor: MotorState,
}

impl Scanner {
    /// Take ownership of an open transport and wait for the instrument to
    /// finish booting.
    pub async fn connect(
        mut transport: Box<dyn Transport>,
        config: &ScannerConfig,
    ) -> ScanResult<Self> {
        info!(transport = transport.kind(), "Connecting to immersion scanner");
        transport.handshake().await?;

        Ok(Self {
            transport,
            calibration: config.calibration.clone(),
            filter: config.filter.clone(),
            timing: config.timing.clone(),
            motor: MotorState::Off,
        })
    }

    /// Open the transport named by the configuration and connect to it.
    pub async fn open(config: &ScannerConfig) -> ScanResult<Self> {
        let transport = transport::open(config).await?;
        Self::connect(transport, config).await
    }

    /// Label of the active transport.
    pub fn transport_kind(&self) -> &'static str {
        self.transport.kind()
    }

    /// Motor state as last commanded.
    pub fn motor_state(&self) -> MotorState {
        self.motor
    }

    /// Calibration in effect for this scanner.
    pub fn calibration(&self) -> &CalibrationConfig {
        &self.calibration
    }

    /// Write a raw command.
    pub async fn send(&mut self, command: &str) -> ScanResult<()> {
        self.transport.send(command).await
    }

    /// Send a raw command and return its reply (`""` on timeout).
    pub async fn query(&mut self, command: &str) -> ScanResult<String> {
        self.transport.query(command).await
    }

    /// Read one reply unit (`""` on timeout).
    pub async fn read(&mut self) -> ScanResult<String> {
        self.transport.receive().await
    }

    /// Send `command` and collect replies until the terminator.
    pub async fn buffer_to(&mut self, command: &str) -> ScanResult<Buffered> {
        self.transport.buffer_to(command).await
    }

    async fn command(&mut self, command: &str, settle: Duration) -> ScanResult<()> {
        self.transport.send(command).await?;
        sleep(settle).await;
        Ok(())
    }

    /// Move the axis to an absolute step position.
    ///
    /// The position is truncated toward zero. Returns after the motion
    /// settle time whether or not the axis has physically arrived.
    pub async fn move_to(&mut self, position: f64) -> ScanResult<()> {
        if !position.is_finite() {
            return Err(ScannerError::InvalidArgument(format!(
                "move target must be finite, got {}",
                position
            )));
        }
        let steps = position.trunc() as i64;
        if self.motor == MotorState::Off {
            debug!(steps, "move requested while motor is off");
        }
        self.command(&format!("OUTP:MOVE {}", steps), self.timing.motion_settle())
            .await?;
        debug!(steps, "axis moved");
        Ok(())
    }

    /// Define the current position as the axis origin.
    pub async fn set_axis_home(&mut self) -> ScanResult<()> {
        if self.motor == MotorState::Off {
            warn!("Homing axis while motor is off");
        }
        self.command("CONT:CONF:AXIS:HOME", self.timing.motion_settle())
            .await?;
        info!("Axis homed");
        Ok(())
    }

    /// Run the firmware's automatic homing routine.
    pub async fn set_auto_home(&mut self) -> ScanResult<()> {
        if self.motor == MotorState::Off {
            warn!("Auto-homing axis while motor is off");
        }
        self.command("CONT:CONF:AXIS:AUHO", self.timing.motion_settle())
            .await?;
        info!("Axis auto-homed");
        Ok(())
    }

    /// Energize the motor.
    pub async fn set_motor_on(&mut self) -> ScanResult<()> {
        self.command("CONT:CONF:MOTR:ON", self.timing.motion_settle())
            .await?;
        self.motor = MotorState::On;
        debug!(motor = %self.motor, "motor state changed");
        Ok(())
    }

    /// Release the motor. Waits the longer braking settle time.
    pub async fn set_motor_off(&mut self) -> ScanResult<()> {
        self.command("CONT:CONF:MOTR:OFF", self.timing.motor_off_settle())
            .await?;
        self.motor = MotorState::Off;
        debug!(motor = %self.motor, "motor state changed");
        Ok(())
    }

    /// Raw identification text (`""` if the instrument did not answer).
    pub async fn get_id(&mut self) -> ScanResult<String> {
        self.transport.query("*IDN?").await
    }

    /// Instrument-side averaged buoyancy over `averages` samples, in volume units.
    pub async fn measure_buoyancy(&mut self, averages: u32) -> ScanResult<f64> {
        let reply = self
            .transport
            .query(&format!("MEAS:BUOY {}", averages))
            .await?;
        let token = strip_line_ending(&reply).trim();
        let raw: f64 = token.parse().map_err(|e| ScannerError::parse(token, e))?;
        Ok(raw / self.calibration.sample_to_volume_factor())
    }

    /// Release the transport. Safe to call more than once.
    pub async fn close(&mut self) -> ScanResult<()> {
        if self.transport.is_open() {
            info!(transport = self.transport.kind(), "Closing scanner link");
        }
        self.transport.close().await
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if self.transport.is_open() {
            warn!(
                transport = self.transport.kind(),
                "Scanner dropped without close(); link released on drop"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use tokio::time::Instant;

    fn unity_config() -> ScannerConfig {
        ScannerConfig {
            calibration: CalibrationConfig::unity(),
            ..ScannerConfig::default()
        }
    }

    async fn scanner(transport: MockTransport) -> Scanner {
        Scanner::connect(Box::new(transport), &unity_config())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_truncates_and_settles() {
        let mock = MockTransport::new();
        let history = mock.history();
        let mut scanner = scanner(mock).await;

        let start = Instant::now();
        scanner.move_to(-1600.7).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(history.commands(), vec!["OUTP:MOVE -1600"]);
        scanner.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_off_settles_longer() {
        let mock = MockTransport::new();
        let history = mock.history();
        let mut scanner = scanner(mock).await;

        scanner.set_motor_on().await.unwrap();
        assert_eq!(scanner.motor_state(), MotorState::On);

        let start = Instant::now();
        scanner.set_motor_off().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(scanner.motor_state(), MotorState::Off);
        assert_eq!(
            history.commands(),
            vec!["CONT:CONF:MOTR:ON", "CONT:CONF:MOTR:OFF"]
        );
        scanner.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_homing_commands() {
        let mock = MockTransport::new();
        let history = mock.history();
        let mut scanner = scanner(mock).await;

        scanner.set_axis_home().await.unwrap();
        scanner.set_auto_home().await.unwrap();
        assert_eq!(
            history.commands(),
            vec!["CONT:CONF:AXIS:HOME", "CONT:CONF:AXIS:AUHO"]
        );
        scanner.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_id_timeout_is_empty() {
        let mut scanner = scanner(MockTransport::new()).await;
        assert_eq!(scanner.get_id().await.unwrap(), "");
        scanner.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_returns_unsolicited_lines_in_order() {
        let mock = MockTransport::new()
            .unsolicited("Instrument setup complete\r\n")
            .unsolicited("Motor stalled\r\n");
        let history = mock.history();
        let mut scanner = scanner(mock).await;

        assert_eq!(scanner.read().await.unwrap(), "Instrument setup complete\r\n");
        assert_eq!(scanner.read().await.unwrap(), "Motor stalled\r\n");
        assert_eq!(scanner.read().await.unwrap(), "");
        assert!(history.commands().is_empty());
        scanner.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_buoyancy_scales_reply() {
        let mock = MockTransport::new().reply("MEAS:BUOY 100", "-254.4\r\n");
        let mut config = ScannerConfig::default();
        config.calibration.grams_per_cubic_unit = 1.0;
        let mut scanner = Scanner::connect(Box::new(mock), &config).await.unwrap();

        let grams = scanner.measure_buoyancy(100).await.unwrap();
        assert!((grams - 20.0).abs() < 1e-9);
        scanner.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_buoyancy_rejects_garbage() {
        let mock = MockTransport::new().reply("MEAS:BUOY 10", "ERR");
        let mut scanner = scanner(mock).await;
        assert!(matches!(
            scanner.measure_buoyancy(10).await,
            Err(ScannerError::Parse { .. })
        ));
        scanner.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let mut scanner = scanner(MockTransport::new()).await;
        scanner.close().await.unwrap();
        scanner.close().await.unwrap();
        assert!(matches!(
            scanner.send("*IDN?").await,
            Err(ScannerError::Channel(_))
        ));
    }

    #[test]
    fn test_motor_state_display() {
        assert_eq!(MotorState::On.to_string(), "on");
        assert_eq!(MotorState::default(), MotorState::Off);
    }
}
