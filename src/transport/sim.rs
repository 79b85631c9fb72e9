//! Simulated instrument
//!
//! An in-process model of the scanner firmware that speaks the same command
//! vocabulary over the [`LineLink`] contract. The immersed object is a right
//! cylinder; buoyancy counts grow with immersion depth and carry uniform
//! noise plus occasional gross outliers.
//!
//! | Command                | Reply                                   |
//! |------------------------|-----------------------------------------|
//! | `*IDN?`                | identification line                     |
//! | `MEAS:BUOY <n>`        | mean of `n` samples                     |
//! | `MEAS:BUOY:VALS <n>`   | `n` comma-terminated samples            |
//! | `OUTP:MOVE <steps>`    | none, moves when the motor is on        |
//! | `CONT:CONF:...`        | none                                    |

use super::serial::LineLink;
use crate::config::{CalibrationConfig, SimulationConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::io;
use std::time::Duration;
use tracing::{debug, trace};

const IDENTITY: &str = "IMMERSION-SIM,buoyancy-scanner,0,1.0";
const READY_LINE: &str = "Instrument setup complete";

/// Simulated scanner firmware
pub struct SimulatedLink {
    config: SimulationConfig,
    counts_per_volume: f64,
    steps_per_unit: f64,
    position: i64,
    motor_on: bool,
    outbox: VecDeque<String>,
    rng: StdRng,
}

impl SimulatedLink {
    /// Build a simulator that reports counts consistent with `calibration`.
    pub fn new(config: SimulationConfig, calibration: &CalibrationConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        let mut outbox = VecDeque::new();
        outbox.push_back(line(READY_LINE));

        Self {
            config,
            counts_per_volume: calibration.sample_to_volume_factor(),
            steps_per_unit: calibration.steps_per_unit,
            position: 0,
            motor_on: false,
            outbox,
            rng,
        }
    }

    /// Current actuator position in steps.
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Volume of the object currently below the fluid surface.
    pub fn displaced_volume(&self) -> f64 {
        let depth = (-(self.position as f64) / self.steps_per_unit).max(0.0);
        PI * self.config.object_radius.powi(2) * depth
    }

    fn sample(&mut self) -> i64 {
        let base = self.displaced_volume() * self.counts_per_volume;
        let half = self.config.noise_counts.abs() / 2.0;
        let noise = self.rng.gen_range(-half..=half);
        let outlier = if self
            .rng
            .gen_bool(self.config.outlier_probability.clamp(0.0, 1.0))
        {
            self.config.outlier_counts
        } else {
            0.0
        };
        (base + noise + outlier).round() as i64
    }

    fn handle(&mut self, command: &str) {
        let (head, arg) = match command.split_once(' ') {
            Some((head, arg)) => (head, Some(arg.trim())),
            None => (command.trim(), None),
        };
        let count = arg.and_then(|a| a.parse::<usize>().ok());

        match (head, count) {
            ("*IDN?", _) => self.outbox.push_back(line(IDENTITY)),
            ("MEAS:BUOY:VALS", Some(n)) => {
                let mut reply = String::new();
                for _ in 0..n {
                    reply.push_str(&self.sample().to_string());
                    reply.push(',');
                }
                self.outbox.push_back(line(&reply));
            }
            ("MEAS:BUOY", Some(n)) => {
                let n = n.max(1);
                let total: i64 = (0..n).map(|_| self.sample()).sum();
                self.outbox.push_back(line(&(total as f64 / n as f64).to_string()));
            }
            ("OUTP:MOVE", _) => match arg.and_then(|a| a.parse::<i64>().ok()) {
                Some(target) if self.motor_on => {
                    debug!(from = self.position, to = target, "simulated axis moved");
                    self.position = target;
                }
                Some(_) => debug!("simulated move ignored, motor is off"),
                None => self.outbox.push_back(line("ERR bad move target")),
            },
            ("CONT:CONF:MOTR:ON", _) => self.motor_on = true,
            ("CONT:CONF:MOTR:OFF", _) => self.motor_on = false,
            ("CONT:CONF:AXIS:HOME", _) | ("CONT:CONF:AXIS:AUHO", _) => self.position = 0,
            _ => self.outbox.push_back(line("ERR unknown command")),
        }
    }
}

fn line(text: &str) -> String {
    format!("{}\r\n", text)
}

impl LineLink for SimulatedLink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        trace!(command = line, "simulated instrument received");
        self.handle(line);
        Ok(())
    }

    fn read_line(&mut self, _timeout: Option<Duration>) -> io::Result<Option<String>> {
        Ok(self.outbox.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> SimulationConfig {
        SimulationConfig {
            object_radius: 1.0,
            noise_counts: 0.0,
            outlier_probability: 0.0,
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn test_boot_line_first() {
        let mut sim = SimulatedLink::new(quiet(), &CalibrationConfig::unity());
        let first = sim.read_line(None).unwrap().unwrap();
        assert!(first.starts_with("Instrument setup"));
        assert!(sim.read_line(None).unwrap().is_none());
    }

    #[test]
    fn test_move_requires_motor() {
        let mut sim = SimulatedLink::new(quiet(), &CalibrationConfig::unity());
        sim.write_line("OUTP:MOVE -10").unwrap();
        assert_eq!(sim.position(), 0);
        sim.write_line("CONT:CONF:MOTR:ON").unwrap();
        sim.write_line("OUTP:MOVE -10").unwrap();
        assert_eq!(sim.position(), -10);
        assert!((sim.displaced_volume() - 10.0 * PI).abs() < 1e-9);
    }

    #[test]
    fn test_sample_dump_is_comma_terminated() {
        let mut sim = SimulatedLink::new(quiet(), &CalibrationConfig::unity());
        sim.read_line(None).unwrap();
        sim.write_line("MEAS:BUOY:VALS 3").unwrap();
        assert_eq!(sim.read_line(None).unwrap().unwrap(), "0,0,0,\r\n");
    }
}
