//! Pixel status codes shared with the controller.

/// Per-pixel outcome published on the `PixelResult` tag and echoed back by
/// the controller on `TestStatus`.
///
/// The code space is the controller's: 0 is reserved for "in progress"
/// (see [`StatusEvent`]), 1 through 4 are test verdicts, 5 marks a pixel
/// the run never reached, and 10 marks everything left behind by an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelStatus {
    Passed = 1,
    HighPowerFailure = 2,
    LowPowerFailure = 3,
    NoPowerFailure = 4,
    Untested = 5,
    Aborted = 10,
}

impl PixelStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Passed),
            2 => Some(Self::HighPowerFailure),
            3 => Some(Self::LowPowerFailure),
            4 => Some(Self::NoPowerFailure),
            5 => Some(Self::Untested),
            10 => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    /// Label used in the processed-data and summary exports.
    pub fn label(self) -> &'static str {
        match self {
            Self::Passed => "PASS",
            Self::HighPowerFailure => "HIGH POWER FAILURE",
            Self::LowPowerFailure => "LOW POWER FAILURE",
            Self::NoPowerFailure => "NO POWER FAILURE",
            Self::Untested => "UNTESTED",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Passed | Self::Untested)
    }
}

/// Events derived from the controller's `TestStatus` tag.
///
/// Code 0 means a test is in flight and code 10 is the controller's
/// critical-failure signal; everything in between is a per-pixel verdict.
/// Only the critical fault is acted on as a status event: ordinary
/// outcomes are decided locally from measured data so a stale echo can
/// never drive progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    InProgress,
    PixelDone(PixelStatus),
    CriticalFault,
}

impl StatusEvent {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::InProgress),
            10 => Some(Self::CriticalFault),
            other => PixelStatus::from_code(other).map(Self::PixelDone),
        }
    }
}
