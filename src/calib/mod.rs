//! Calibration engine.
//!
//! Consumes the raw pulse buffers the orchestrator collected, fits one
//! correction curve per pixel in the normalized-power domain, and scales
//! and encodes each curve into the firmware blob the racks load.

pub mod fit;
pub mod lut;

pub use fit::{fit_quadratic, percent_diff, Quadratic};
pub use lut::{encode_blob, linear_lut, scale_curve, ScaledLut, LUT_ENTRIES, MAX_ANALOG};

use crate::error::{CalError, CalResult};
use crate::orchestrator::samples::RawSampleSet;
use crate::orchestrator::settings::TestSettings;
use crate::orchestrator::status::PixelStatus;
use crate::pixel::PixelMap;
use tracing::{info, warn};

/// One pixel's complete calibration output.
#[derive(Debug, Clone)]
pub struct PixelCalibration {
    pub pixel: u32,
    pub rack: u8,
    pub laser: u8,
    pub coefficients: Quadratic,
    pub lut: ScaledLut,
    /// Tolerance status carried over from the test run.
    pub status: PixelStatus,
    /// The 516-byte firmware blob for this pixel.
    pub blob: Vec<u8>,
}

/// All pixel calibrations for one run, in tested order.
#[derive(Debug, Clone, Default)]
pub struct CalibrationSet {
    /// Calibration generation the set was produced under.
    pub cal_id: u32,
    pub pixels: Vec<PixelCalibration>,
}

impl CalibrationSet {
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Pixels whose curve saturated below the controllable-power floor.
    pub fn power_called_failures(&self) -> Vec<u32> {
        self.pixels
            .iter()
            .filter(|p| p.lut.power_called_failure)
            .map(|p| p.pixel)
            .collect()
    }
}

/// Fits and encodes LUTs for every captured pixel.
pub struct CalibrationEngine<'a> {
    settings: &'a TestSettings,
    pixel_map: &'a PixelMap,
}

impl<'a> CalibrationEngine<'a> {
    pub fn new(settings: &'a TestSettings, pixel_map: &'a PixelMap) -> Self {
        Self {
            settings,
            pixel_map,
        }
    }

    /// Normalized (commanded, measured) fractions, one point per power
    /// level.
    ///
    /// The fit runs on the per-level segment means, not individual pulses,
    /// so a level that retained more pulses (flagged pulses discarded,
    /// surplus folded into the last level) carries no extra weight.
    /// Measured power is mean pulse energy over the pulse-on window; both
    /// axes are divided down by the available laser power so the fit lives
    /// in [0, 1] and scales directly onto the drive table.
    fn fit_points(&self, samples: &RawSampleSet) -> Vec<(f64, f64)> {
        let available = self.settings.available_laser_power_watts;
        let pulse_on = self.settings.pulse_on_secs();
        samples
            .split_levels()
            .iter()
            .map(|level| {
                let commanded = level[0].commanded_watts;
                let mean_energy =
                    level.iter().map(|p| p.energy_joules).sum::<f64>() / level.len() as f64;
                let measured_watts = mean_energy / pulse_on;
                (commanded / available, measured_watts / available)
            })
            .collect()
    }

    /// Calibrate one pixel: fit, scale, encode.
    ///
    /// Only a passed pixel gets a curve fitted from its data; a pixel that
    /// failed or was never reached keeps the identity line, so a bad
    /// measurement can never bend the drive table.
    pub fn calibrate_pixel(
        &self,
        samples: &RawSampleSet,
        status: PixelStatus,
    ) -> CalResult<PixelCalibration> {
        let channel = self.pixel_map.channel(samples.pixel).ok_or_else(|| {
            CalError::Configuration(format!("pixel {} not in the pixel map", samples.pixel))
        })?;

        let coefficients = if status == PixelStatus::Passed {
            fit_quadratic(&self.fit_points(samples))
        } else {
            Quadratic::IDENTITY
        };
        let lut = scale_curve(
            &coefficients,
            self.settings.power_modified_limit,
            self.settings.power_called_limit,
        );
        if lut.power_called_failure {
            warn!(
                pixel = samples.pixel,
                "curve saturates below the controllable-power floor"
            );
        }
        let blob = encode_blob(&lut);
        Ok(PixelCalibration {
            pixel: samples.pixel,
            rack: channel.rack,
            laser: channel.laser,
            coefficients,
            lut,
            status,
            blob,
        })
    }

    /// Calibrate every captured pixel, in tested order.
    pub fn calibrate(
        &self,
        captured: &[(RawSampleSet, PixelStatus)],
    ) -> CalResult<CalibrationSet> {
        let mut set = CalibrationSet {
            cal_id: self.settings.cal_id,
            ..CalibrationSet::default()
        };
        for (samples, status) in captured {
            set.pixels.push(self.calibrate_pixel(samples, *status)?);
        }
        info!(
            pixels = set.pixels.len(),
            called_failures = set.power_called_failures().len(),
            "calibration set complete"
        );
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MeterSample;
    use crate::orchestrator::settings::TestType;

    fn settings() -> TestSettings {
        let mut s = TestSettings::defaults(TestType::Calibration);
        s.pixel_list = vec![1];
        s
    }

    fn samples_for(pixel: u32, levels: &[(f64, f64)]) -> RawSampleSet {
        let mut set = RawSampleSet::new(pixel);
        for &(commanded, energy) in levels {
            set.ingest(
                commanded,
                &[crate::instrument::MeterSample::clean(energy, 0.0)],
            );
        }
        set
    }

    #[test]
    fn ideal_laser_calibrates_to_near_identity() {
        let settings = settings();
        let map = PixelMap::sequential(84, 21);
        let engine = CalibrationEngine::new(&settings, &map);

        // Each pulse delivers exactly the commanded energy.
        let pulse_on = settings.pulse_on_secs();
        let levels: Vec<(f64, f64)> = settings
            .commanded_levels_watts()
            .into_iter()
            .map(|w| (w, w * pulse_on))
            .collect();
        let samples = samples_for(1, &levels);

        let cal = engine
            .calibrate_pixel(&samples, PixelStatus::Passed)
            .unwrap();
        assert!(cal.coefficients.a.abs() < 1e-6);
        assert!((cal.coefficients.b - 1.0).abs() < 1e-6);
        assert!(cal.coefficients.c.abs() < 1e-6);
        assert_eq!(cal.blob.len(), 516);
        assert_eq!((cal.rack, cal.laser), (1, 1));
        assert!(!cal.lut.power_called_failure);
    }

    #[test]
    fn fit_weighs_each_level_once_regardless_of_pulse_count() {
        let settings = settings();
        let map = PixelMap::sequential(84, 21);
        let engine = CalibrationEngine::new(&settings, &map);
        let available = settings.available_laser_power_watts;
        let pulse_on = settings.pulse_on_secs();

        // Four levels whose means do not sit on one quadratic; the first
        // level kept three pulses, the rest one each.
        let commanded = [100.0, 200.0, 300.0, 400.0];
        let measured_means = [90.0, 210.0, 280.0, 410.0];
        let mut set = RawSampleSet::new(1);
        set.ingest(
            commanded[0],
            &[
                MeterSample::clean(80.0 * pulse_on, 0.0),
                MeterSample::clean(90.0 * pulse_on, 0.1),
                MeterSample::clean(100.0 * pulse_on, 0.2),
            ],
        );
        for i in 1..4 {
            let sample = MeterSample::clean(measured_means[i] * pulse_on, i as f64);
            set.ingest(commanded[i], std::slice::from_ref(&sample));
        }

        let mean_points: Vec<(f64, f64)> = commanded
            .iter()
            .zip(&measured_means)
            .map(|(&c, &m)| (c / available, m / available))
            .collect();
        let expected = fit_quadratic(&mean_points);
        let per_pulse = fit_quadratic(&engine_pulse_points(&set, available, pulse_on));
        // Sanity: unequal pulse counts make the two fits diverge.
        assert!((expected.b - per_pulse.b).abs() > 1e-9);

        let cal = engine
            .calibrate_pixel(&set, PixelStatus::Passed)
            .unwrap();
        assert!((cal.coefficients.a - expected.a).abs() < 1e-6);
        assert!((cal.coefficients.b - expected.b).abs() < 1e-6);
        assert!((cal.coefficients.c - expected.c).abs() < 1e-6);
    }

    fn engine_pulse_points(set: &RawSampleSet, available: f64, pulse_on: f64) -> Vec<(f64, f64)> {
        set.pulses()
            .iter()
            .map(|p| {
                (
                    p.commanded_watts / available,
                    p.energy_joules / pulse_on / available,
                )
            })
            .collect()
    }

    #[test]
    fn failed_pixels_keep_the_identity_line() {
        let settings = settings();
        let map = PixelMap::sequential(84, 21);
        let engine = CalibrationEngine::new(&settings, &map);

        // Data that would fit to b = 0.5 must not reach the table.
        let levels: Vec<(f64, f64)> = settings
            .commanded_levels_watts()
            .into_iter()
            .map(|w| (w, 0.5 * w * settings.pulse_on_secs()))
            .collect();
        let samples = samples_for(2, &levels);

        let cal = engine
            .calibrate_pixel(&samples, PixelStatus::LowPowerFailure)
            .unwrap();
        assert_eq!(cal.coefficients.a, 0.0);
        assert_eq!(cal.coefficients.b, 1.0);
        assert_eq!(cal.coefficients.c, 0.0);

        let untested = engine
            .calibrate_pixel(&RawSampleSet::new(3), PixelStatus::Untested)
            .unwrap();
        assert_eq!(untested.coefficients.b, 1.0);
    }

    #[test]
    fn unknown_pixel_is_a_configuration_error() {
        let settings = settings();
        let map = PixelMap::sequential(4, 2);
        let engine = CalibrationEngine::new(&settings, &map);
        let samples = samples_for(99, &[(49.4, 0.25)]);
        assert!(matches!(
            engine.calibrate_pixel(&samples, PixelStatus::Passed),
            Err(CalError::Configuration(_))
        ));
    }
}
