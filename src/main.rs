//! CLI Entry Point for the immersion scanner
//!
//! Provides command-line access to:
//! - Instrument identification and raw queries
//! - Motor power, homing and absolute moves
//! - Single filtered layer measurements
//! - Full volume scans with CSV/JSON export
//!
//! # Usage
//!
//! Scan 40 layers of 1.25 mm over the default serial port:
//! ```bash
//! immersion-scanner scan --layer-height 0.00125 --layers 40 --csv profile.csv
//! ```
//!
//! Talk to the instrument through an MQTT broker:
//! ```bash
//! immersion-scanner --transport mqtt --broker 192.168.1.20 id
//! ```
//!
//! Try the pipeline without hardware:
//! ```bash
//! immersion-scanner --config config/simulated.toml scan --layer-height 0.01 --layers 5 --averages 200
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use immersion_scanner::config::{ScannerConfig, TransportKind, DEFAULT_CONFIG_PATH};
use immersion_scanner::{export, logging, Scanner};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "immersion-scanner")]
#[command(about = "Buoyancy-based immersion volume scanner", long_about = None)]
struct Cli {
    /// Configuration file (TOML format)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured transport
    #[arg(long, global = true, value_enum)]
    transport: Option<TransportArg>,

    /// Serial port (e.g. /dev/ttyACM0, COM3)
    #[arg(long, global = true)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// MQTT broker host
    #[arg(long, global = true)]
    broker: Option<String>,

    /// MQTT broker port
    #[arg(long, global = true)]
    broker_port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    Serial,
    Mqtt,
    Sim,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Serial => TransportKind::Serial,
            TransportArg::Mqtt => TransportKind::Mqtt,
            TransportArg::Sim => TransportKind::Simulated,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum MotorArg {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the instrument identification
    Id,

    /// Send a raw command and print the reply
    Query {
        /// Command text, e.g. "MEAS:BUOY 10"
        command: String,
    },

    /// Switch motor power
    Motor {
        #[arg(value_enum)]
        state: MotorArg,
    },

    /// Define the current position as the axis origin
    Home,

    /// Run the automatic homing routine
    AutoHome,

    /// Move the axis to an absolute step position
    Move {
        /// Target position in steps (negative is deeper)
        #[arg(allow_negative_numbers = true)]
        position: f64,
    },

    /// Measure the current layer with outlier filtering
    Measure {
        /// Raw samples to request
        #[arg(long, default_value_t = 1000)]
        averages: u32,
    },

    /// Read the instrument's own averaged buoyancy
    Buoyancy {
        /// Samples averaged by the instrument
        #[arg(long, default_value_t = 100)]
        averages: u32,
    },

    /// Scan the object layer by layer
    Scan {
        /// Layer height in length units (metres with the default calibration)
        #[arg(long)]
        layer_height: f64,

        /// Number of layers
        #[arg(long)]
        layers: u32,

        /// Raw samples per layer
        #[arg(long, default_value_t = 1000)]
        averages: u32,

        /// Write the profile as CSV
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Print the profile as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List serial ports visible to the OS
    Ports,
}

impl Cli {
    fn apply_overrides(&self, config: &mut ScannerConfig) {
        if let Some(kind) = self.transport {
            config.transport.kind = kind.into();
        }
        if let Some(port) = &self.port {
            config.transport.serial.port = port.clone();
        }
        if let Some(baud) = self.baud {
            config.transport.serial.baud_rate = baud;
        }
        if let Some(broker) = &self.broker {
            config.transport.mqtt.broker = broker.clone();
        }
        if let Some(port) = self.broker_port {
            config.transport.mqtt.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ScannerConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    cli.apply_overrides(&mut config);
    config.validate().context("Invalid configuration")?;

    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    if let Commands::Ports = cli.command {
        return list_ports();
    }

    info!(transport = ?config.transport.kind, "Starting immersion scanner");
    let mut scanner = Scanner::open(&config)
        .await
        .context("Failed to connect to the scanner")?;

    let outcome = run(&mut scanner, cli.command).await;
    scanner.close().await.context("Failed to close the scanner link")?;
    outcome
}

async fn run(scanner: &mut Scanner, command: Commands) -> Result<()> {
    match command {
        Commands::Id => {
            let id = scanner.get_id().await?;
            if id.is_empty() {
                println!("(no reply)");
            } else {
                println!("{}", id.trim_end());
            }
        }
        Commands::Query { command } => {
            let reply = scanner.query(&command).await?;
            println!("{}", reply.trim_end());
        }
        Commands::Motor { state } => match state {
            MotorArg::On => scanner.set_motor_on().await?,
            MotorArg::Off => scanner.set_motor_off().await?,
        },
        Commands::Home => scanner.set_axis_home().await?,
        Commands::AutoHome => scanner.set_auto_home().await?,
        Commands::Move { position } => scanner.move_to(position).await?,
        Commands::Measure { averages } => {
            let result = scanner
                .measure_and_filter(averages)
                .await
                .context("Layer measurement failed")?;
            println!(
                "average {} ({} of {} samples kept)",
                result.average,
                result.filtered_samples.len(),
                result.raw_samples.len()
            );
        }
        Commands::Buoyancy { averages } => {
            println!("{}", scanner.measure_buoyancy(averages).await?);
        }
        Commands::Scan {
            layer_height,
            layers,
            averages,
            csv,
            json,
        } => {
            let profile = scanner
                .scan(layer_height, layers, averages)
                .await
                .context("Scan failed")?;

            if let Some(path) = csv {
                export::write_csv(&profile, &path)
                    .with_context(|| format!("Failed to write CSV to {:?}", path))?;
            }

            if json {
                println!("{}", export::to_json(&profile)?);
            } else {
                let radii = profile.radii().ok();
                println!("{:>6} {:>14} {:>14} {:>14}", "layer", "height", "volume", "radius");
                for (layer, (height, volume)) in
                    profile.heights.iter().zip(&profile.volumes).enumerate()
                {
                    let radius = radii
                        .as_ref()
                        .and_then(|r| r.get(layer))
                        .map_or_else(|| "-".to_string(), |r| format!("{:.6e}", r));
                    println!("{:>6} {:>14.6e} {:>14.6e} {:>14}", layer, height, volume, radius);
                }
                println!("total volume {:.6e}", profile.total_volume());
            }
        }
        Commands::Ports => list_ports()?,
    }
    Ok(())
}

#[cfg(feature = "instrument_serial")]
fn list_ports() -> Result<()> {
    let ports = immersion_scanner::transport::list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
fn list_ports() -> Result<()> {
    Err(immersion_scanner::ScannerError::FeatureNotEnabled("instrument_serial".to_string()).into())
}
