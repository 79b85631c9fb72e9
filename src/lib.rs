//! Core library for the immersion scanner.
//!
//! The scanner lowers an object through a fluid in discrete layers while a
//! buoyancy sensor reports how much fluid it displaces. This library contains
//! the transports that reach the instrument, the command protocol, the
//! sample filtering pipeline and the scan orchestrator that turns filtered
//! readings into a volume-by-height profile. It is used by the
//! `immersion-scanner` command-line binary.
//!
//! ```no_run
//! use immersion_scanner::{config::ScannerConfig, Scanner};
//!
//! # async fn run() -> immersion_scanner::ScanResult<()> {
//! let config = ScannerConfig::load()?;
//! let mut scanner = Scanner::open(&config).await?;
//! let profile = scanner.scan(0.00125, 40, 1000).await?;
//! let radii = profile.radii()?;
//! scanner.close().await?;
//! # let _ = radii;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod export;
pub mod geometry;
pub mod logging;
pub mod protocol;
pub mod sampling;
pub mod scan;
pub mod transport;

pub use error::{ScanResult, ScannerError};
pub use protocol::{MotorState, Scanner};
pub use sampling::{BuoyancyFilter, FilterOutcome, LayerResult};
pub use scan::ScanProfile;
pub use transport::{Buffered, Transport};
