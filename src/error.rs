//! Custom error types for the application.
//!
//! `CalError` consolidates the error taxonomy: `Connection` is fatal to the
//! session and shuts the tag loop down; `Configuration` (free-form or coded
//! by the controller's rejection table) blocks a test from starting;
//! `Capture` marks the affected pixel and lets the run continue; `Transfer`
//! surfaces upload failures after the bounded retry. Handlers never panic
//! past the orchestrator boundary.

use crate::tags::TagId;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type CalResult<T> = std::result::Result<T, CalError>;

#[derive(Error, Debug)]
pub enum CalError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Controller rejected configuration: {0}")]
    ConfigRejected(ConfigErrorCode),

    #[error("Controller session failure: {0}")]
    Connection(String),

    #[error("Tag {0} is subscribed; the controller is its writer of record")]
    NotWritable(TagId),

    #[error("Invalid value for tag {tag}: {reason}")]
    InvalidType { tag: TagId, reason: String },

    #[error("Capture failure: {0}")]
    Capture(String),

    #[error("Transfer failure: {0}")]
    Transfer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Controller-issued configuration rejection codes, published on the
/// `ErrorNum` tag after a configuration push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorCode {
    PixelOutOfBounds = 1,
    DisabledPixel = 2,
    ZeroFirstElement = 3,
    ZeroTestPixel = 4,
    ZeroNumPulses = 5,
    ZeroAvailablePower = 6,
    ZeroSafeLimit = 7,
    ZeroStartingPower = 8,
}

impl ConfigErrorCode {
    /// Decode a non-zero `ErrorNum` value; zero means accepted.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::PixelOutOfBounds),
            2 => Some(Self::DisabledPixel),
            3 => Some(Self::ZeroFirstElement),
            4 => Some(Self::ZeroTestPixel),
            5 => Some(Self::ZeroNumPulses),
            6 => Some(Self::ZeroAvailablePower),
            7 => Some(Self::ZeroSafeLimit),
            8 => Some(Self::ZeroStartingPower),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConfigErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::PixelOutOfBounds => "PIXEL OUT OF BOUNDS",
            Self::DisabledPixel => "DISABLED PIXEL",
            Self::ZeroFirstElement => "ZERO FIRST ELEMENT",
            Self::ZeroTestPixel => "ZERO TEST PIXEL",
            Self::ZeroNumPulses => "ZERO NUM PULSES",
            Self::ZeroAvailablePower => "ZERO AVAILABLE POWER",
            Self::ZeroSafeLimit => "ZERO SAFE LIMIT",
            Self::ZeroStartingPower => "ZERO STARTING POWER",
        };
        f.write_str(text)
    }
}
