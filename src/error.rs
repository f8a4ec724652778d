//! Custom error types for the acquisition engine.
//!
//! `DaqError` is the single error type returned by every library surface. It follows
//! the taxonomy the engine relies on when deciding what to absorb and what to propagate:
//!
//! - **Configuration errors** (`UnknownFilter`, `UnknownZoom`, `UnknownChannel`,
//!   `UnknownDevice`, `Configuration`, `Config`): raised synchronously at the point of use,
//!   never defaulted.
//! - **Programming errors** (`MissingChannelTiming`): a channel registered in one timing
//!   table but not the other. Always raised.
//! - **Connection errors** (`ConnectionExhausted`): produced by `connect_with_retry` once
//!   every attempt has failed. Fatal at startup.
//! - **Acquisition errors** (`AckTimeout`, `ChannelClosed`, `Instrument`): fatal to the
//!   running acquisition. The orchestrator releases device resources before they reach
//!   the caller.
//!
//! Stage bounds violations are deliberately absent: `Stage::move_absolute` reports them
//! as `Ok(false)`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filter name missing from the configured filter dictionary.
    #[error("Unknown filter '{name}' (available: {available:?})")]
    UnknownFilter {
        /// Requested filter name
        name: String,
        /// Names present in the filter dictionary
        available: Vec<String>,
    },

    /// Zoom name missing from the configured zoom positions.
    #[error("Unknown zoom '{0}'")]
    UnknownZoom(String),

    /// Channel id not present in the microscope state.
    #[error("Unknown channel {0}")]
    UnknownChannel(usize),

    /// Device type tag with no registered driver.
    #[error("Unknown device type '{0}'")]
    UnknownDevice(String),

    /// A selected channel has an exposure time but no sweep time (or vice versa).
    #[error("Channel {channel} has no entry in the {missing} table")]
    MissingChannelTiming {
        /// Channel id
        channel: usize,
        /// Which timing table lacks the key ("exposure_times" or "sweep_times")
        missing: &'static str,
    },

    /// Device connection failed on every attempt.
    #[error("Failed to connect {device} after {attempts} attempts: {last_error}")]
    ConnectionExhausted {
        /// Device role or name
        device: String,
        /// Number of attempts made
        attempts: u32,
        /// Message of the final failure
        last_error: String,
    },

    /// Device failed to acknowledge a trigger in time.
    #[error("Device did not acknowledge frame {frame_id} within {timeout:?}")]
    AckTimeout {
        /// Frame id of the unacknowledged trigger
        frame_id: u64,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Error reported by a device.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// One side of the signal/data handshake went away.
    #[error("Acquisition channel closed: {0}")]
    ChannelClosed(String),

    /// Error raised by a feature node.
    #[error("Feature '{feature}' failed: {message}")]
    Feature {
        /// Feature name
        feature: String,
        /// Failure description
        message: String,
    },

    /// I/O failure (data sink, config file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Whether the condition can be absorbed without aborting the acquisition.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DaqError::Instrument(_) | DaqError::Feature { .. } => true,
            DaqError::Config(_)
            | DaqError::Configuration(_)
            | DaqError::UnknownFilter { .. }
            | DaqError::UnknownZoom(_)
            | DaqError::UnknownChannel(_)
            | DaqError::UnknownDevice(_)
            | DaqError::MissingChannelTiming { .. }
            | DaqError::ConnectionExhausted { .. }
            | DaqError::AckTimeout { .. }
            | DaqError::ChannelClosed(_)
            | DaqError::Io(_)
            | DaqError::Serialization(_) => false,
        }
    }
}
