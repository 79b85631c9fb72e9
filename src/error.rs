//! Custom error types for the scanner.
//!
//! This module defines the primary error type, `ScannerError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that can occur while driving the instrument, from
//! an unavailable link to a measurement that never settles.
//!
//! ## Error Hierarchy
//!
//! - **`Channel`**: The transport is closed, was never opened, or refused a write.
//!   Fatal to the call and never retried automatically.
//! - **`Parse`**: A reply token that should have been numeric was not. There is no
//!   recovery path; the in-progress operation is aborted.
//! - **`FilterConvergence`**: Every measurement attempt for a layer was rejected by the
//!   grouped-deviation filter and the retry budget is spent.
//! - **`InvalidArgument`**: Caller supplied scan or geometry input that cannot work.
//! - **`Config`**: Loading or validating the configuration failed.
//! - **`Io`**: Wraps standard `std::io::Error`.
//! - **`Export`**: A scan profile could not be serialized or written.
//! - **`FeatureNotEnabled`**: A transport was requested that was not compiled in.
//!
//! Receive timeouts are deliberately *not* an error variant. Both transports report
//! "nothing arrived in time" as an empty reply string so that callers branch the same
//! way regardless of which link is active.

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the scanner error type.
pub type ScanResult<T> = std::result::Result<T, ScannerError>;

/// Errors raised by the scanner core.
#[derive(Error, Debug)]
pub enum ScannerError {
    /// Transport unavailable or misused.
    #[error("Channel error: {0}")]
    Channel(String),

    /// Non-numeric token in an instrument reply.
    #[error("Failed to parse instrument reply token '{token}'")]
    Parse {
        /// The offending token, as received.
        token: String,
        /// Underlying parser failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// No sample group passed the deviation threshold within the retry budget.
    #[error("Buoyancy filter did not converge after {attempts} attempts")]
    FilterConvergence {
        /// Number of full measurements that were attempted.
        attempts: u32,
    },

    /// Input rejected before any instrument traffic.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Writing a scan profile out failed.
    #[error("Export error: {0}")]
    Export(String),

    /// A transport that was not compiled into this build.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl ScannerError {
    pub(crate) fn parse(
        token: &str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Parse {
            token: token.to_string(),
            source: Box::new(source),
        }
    }
}
