//! Per-run test configuration snapshot.

use crate::error::{CalError, CalResult};
use serde::{Deserialize, Serialize};

/// Kind of test the process team is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestType {
    /// Generates new correction LUTs; runs against linear LUTs.
    Calibration,
    /// Laser-health verification with a clean debris shield.
    CleanPowerVerification,
    /// Laser-health verification with a dirty debris shield.
    DirtyPowerVerification,
    /// Basic are-the-lasers-firing check.
    LowPowerCheck,
}

impl TestType {
    /// Code used on the `TestType` controller tag.
    pub fn controller_code(self) -> i64 {
        match self {
            TestType::LowPowerCheck => 1,
            TestType::Calibration => 2,
            TestType::CleanPowerVerification => 3,
            TestType::DirtyPowerVerification => 4,
        }
    }

    /// Short form used in exports and directory names.
    pub fn export_label(self) -> &'static str {
        match self {
            TestType::LowPowerCheck => "LOWPOWER",
            TestType::Calibration => "CAL",
            TestType::CleanPowerVerification => "CVER",
            TestType::DirtyPowerVerification => "DVER",
        }
    }

    pub fn is_calibration(self) -> bool {
        matches!(self, TestType::Calibration)
    }
}

/// Pixel progression policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestMode {
    /// Advance automatically even when a pixel fails tolerance.
    Continuous,
    /// Failed pixels wait for explicit operator confirmation.
    SemiAuto,
}

/// Immutable-per-run test configuration, snapshotted at session start from
/// controller values or operator overrides. Consumed read-only by the
/// orchestrator and the calibration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSettings {
    pub test_type: TestType,
    pub test_mode: TestMode,
    /// Calibration generation, embedded in filenames and audit rows.
    pub cal_id: u32,
    pub pulse_delay_msec: f64,
    pub pulse_on_msec: f64,
    pub pulse_off_msec: f64,
    pub num_pulses_per_level: usize,
    pub available_laser_power_watts: f64,
    pub safe_power_limit_watts: f64,
    /// Starting commanded level on the controller's 8-bit scale.
    pub starting_power_level: f64,
    pub num_power_level_steps: usize,
    /// Level increment on the 8-bit scale.
    pub power_level_increment: f64,
    pub tolerance_percent: f64,
    /// Upper clamp on the encoded LUT, as a fraction of full scale.
    pub power_modified_limit: f64,
    /// Fraction of the 8-bit input range that must stay below the clamp.
    pub power_called_limit: f64,
    /// 1-based pixel indices to test, in order.
    pub pixel_list: Vec<u32>,
    pub operator_name: String,
    pub sensor_number: String,
    pub meter_serial: String,
}

impl TestSettings {
    /// Process-team defaults for the given test type.
    pub fn defaults(test_type: TestType) -> Self {
        Self {
            test_type,
            test_mode: TestMode::SemiAuto,
            cal_id: 99_999,
            pulse_delay_msec: 0.0,
            pulse_on_msec: 5.0,
            pulse_off_msec: 58.0,
            num_pulses_per_level: 1,
            available_laser_power_watts: 525.0,
            safe_power_limit_watts: 300.0,
            starting_power_level: 24.0,
            num_power_level_steps: 2,
            power_level_increment: 5.0,
            tolerance_percent: 50.0,
            power_modified_limit: 1.0,
            power_called_limit: 0.6,
            pixel_list: Vec::new(),
            operator_name: String::new(),
            sensor_number: String::new(),
            meter_serial: String::new(),
        }
    }

    /// Commanded power in watts for a 0-based level step.
    ///
    /// The 8-bit commanded level maps linearly onto the available laser
    /// power: `watts = level * available / 255`.
    pub fn commanded_level_watts(&self, step: usize) -> f64 {
        (self.starting_power_level + step as f64 * self.power_level_increment)
            * self.available_laser_power_watts
            / 255.0
    }

    /// All commanded levels for the run, in watts.
    pub fn commanded_levels_watts(&self) -> Vec<f64> {
        (0..self.num_power_level_steps)
            .map(|step| self.commanded_level_watts(step))
            .collect()
    }

    pub fn pulse_on_secs(&self) -> f64 {
        self.pulse_on_msec / 1000.0
    }

    /// Full delay + on + off window for one pulse.
    pub fn pulse_period_msec(&self) -> f64 {
        self.pulse_delay_msec + self.pulse_on_msec + self.pulse_off_msec
    }

    /// Checks that block a test from starting.
    pub fn validate(&self, num_pixels: usize) -> CalResult<()> {
        if self.num_pulses_per_level == 0 {
            return Err(CalError::Configuration("zero pulses per level".into()));
        }
        if self.num_power_level_steps == 0 {
            return Err(CalError::Configuration("zero power level steps".into()));
        }
        if self.available_laser_power_watts <= 0.0 {
            return Err(CalError::Configuration("zero available power".into()));
        }
        if self.safe_power_limit_watts <= 0.0 {
            return Err(CalError::Configuration("zero safe power limit".into()));
        }
        if self.starting_power_level <= 0.0 {
            return Err(CalError::Configuration("zero starting power".into()));
        }
        if self.pulse_on_msec <= 0.0 {
            return Err(CalError::Configuration("zero pulse-on time".into()));
        }
        if self.pixel_list.is_empty() {
            return Err(CalError::Configuration("empty pixel list".into()));
        }
        if let Some(&bad) = self
            .pixel_list
            .iter()
            .find(|&&p| p == 0 || p as usize > num_pixels)
        {
            return Err(CalError::Configuration(format!(
                "pixel index {bad} out of range 1..={num_pixels}"
            )));
        }
        if !(0.0..=100.0).contains(&self.tolerance_percent) {
            return Err(CalError::Configuration(format!(
                "tolerance {}% out of range",
                self.tolerance_percent
            )));
        }
        Ok(())
    }

    /// Human-readable pairs for the run's settings log.
    pub fn log_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("Pulse Delay (ms)".into(), self.pulse_delay_msec.to_string()),
            ("Pulse On (ms)".into(), self.pulse_on_msec.to_string()),
            ("Pulse Off (ms)".into(), self.pulse_off_msec.to_string()),
            (
                "Number of Pulses Per Level".into(),
                self.num_pulses_per_level.to_string(),
            ),
            (
                "Available Laser Power (W)".into(),
                self.available_laser_power_watts.to_string(),
            ),
            (
                "Safe Power Limit (W)".into(),
                self.safe_power_limit_watts.to_string(),
            ),
            (
                "Starting Power (8 Bit)".into(),
                self.starting_power_level.to_string(),
            ),
            (
                "Number of Power Level Steps".into(),
                self.num_power_level_steps.to_string(),
            ),
            (
                "Power Level Increment (8 Bit)".into(),
                self.power_level_increment.to_string(),
            ),
            (
                "Tolerance Band (%)".into(),
                self.tolerance_percent.to_string(),
            ),
            ("Test Type".into(), self.test_type.export_label().into()),
            ("Pixel List".into(), format!("{:?}", self.pixel_list)),
        ]
    }
}
