//! CSV artifacts written at the end of a run.
//!
//! Every run gets its own directory under the output root; calibration runs
//! land under `30_Calibrations`, verification and low-power runs under
//! `40_Verifications`. The process team consumes these files directly, so
//! column layouts are part of the external contract and change only with
//! their sign-off.

use crate::calib::{percent_diff, CalibrationSet};
use crate::config::SessionInfo;
use crate::orchestrator::settings::TestSettings;
use crate::orchestrator::status::PixelStatus;
use crate::orchestrator::RunReport;
use crate::pixel::PixelMap;
use crate::error::CalResult;
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Create the run's artifact directory, following the share's naming
/// convention. A `_NN` suffix is appended on collision so re-runs never
/// overwrite earlier data.
pub fn create_run_dir(
    output_root: &Path,
    session: &SessionInfo,
    settings: &TestSettings,
) -> CalResult<PathBuf> {
    let now = Local::now();
    let machine = session.padded_machine_id();
    let base = if settings.test_type.is_calibration() {
        output_root.join("30_Calibrations").join(format!(
            "{machine}_LUT_{:05}_{}",
            settings.cal_id,
            now.format("%Y%m%d")
        ))
    } else {
        output_root.join("40_Verifications").join(format!(
            "{machine}-{}-{}-LUT-{:05}_{}",
            now.format("%Y%m%d"),
            now.format("%H%M%S"),
            settings.cal_id,
            settings.test_type.export_label()
        ))
    };

    let mut dir = base.clone();
    let mut suffix = 0u32;
    while dir.exists() {
        suffix += 1;
        dir = PathBuf::from(format!("{}_{suffix:02}", base.display()));
    }
    fs::create_dir_all(&dir)?;
    info!(dir = %dir.display(), "run directory created");
    Ok(dir)
}

/// Writes every artifact for one finished run.
pub struct RunExporter<'a> {
    dir: &'a Path,
    session: &'a SessionInfo,
    report: &'a RunReport,
    pixel_map: &'a PixelMap,
}

impl<'a> RunExporter<'a> {
    pub fn new(
        dir: &'a Path,
        session: &'a SessionInfo,
        report: &'a RunReport,
        pixel_map: &'a PixelMap,
    ) -> Self {
        Self {
            dir,
            session,
            report,
            pixel_map,
        }
    }

    /// Write every artifact the run calls for.
    pub fn write_all(&self) -> CalResult<()> {
        self.write_raw()?;
        self.write_processed()?;
        self.write_settings_log()?;
        self.write_summary()?;
        if let Some(calibration) = &self.report.calibration {
            self.write_coefficients(calibration)?;
            self.write_lut_audit(calibration)?;
        }
        Ok(())
    }

    fn channel(&self, pixel: u32) -> (u8, u8) {
        self.pixel_map
            .channel(pixel)
            .map_or((0, 0), |c| (c.rack, c.laser))
    }

    /// `LPM_Raw.csv`: one row per pixel of `[pixel, status, samples...]`,
    /// zero-padded on the right so every row has the same width.
    pub fn write_raw(&self) -> CalResult<()> {
        let widest = self
            .report
            .outcomes
            .iter()
            .map(|o| o.samples.len())
            .max()
            .unwrap_or(0);
        let mut writer = csv::Writer::from_path(self.dir.join("LPM_Raw.csv"))?;
        for outcome in &self.report.outcomes {
            let mut row = vec![
                outcome.pixel.to_string(),
                outcome.status.code().to_string(),
            ];
            row.extend(
                outcome
                    .samples
                    .pulses()
                    .iter()
                    .map(|p| p.energy_joules.to_string()),
            );
            row.resize(widest + 2, "0".to_string());
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// `LPM_processed.csv`: one row per pixel per power level with the
    /// level statistics the process team trends.
    pub fn write_processed(&self) -> CalResult<()> {
        let mut writer = csv::Writer::from_path(self.dir.join("LPM_processed.csv"))?;
        writer.write_record([
            "Date",
            "Machine ID",
            "Factory ID",
            "Test Type",
            "Pixel",
            "Rack",
            "Laser",
            "Process Acceptance",
            "Status",
            "Commanded Power",
            "Pulse Power Average",
            "Pulse Power Stdv",
            "Pulse Power Deviation",
            "Data Points",
        ])?;

        let date = Local::now().format("%Y-%m-%d").to_string();
        let pulse_on = self.report.settings.pulse_on_secs();
        for outcome in &self.report.outcomes {
            let (rack, laser) = self.channel(outcome.pixel);
            let levels = outcome.samples.split_levels();
            if levels.is_empty() {
                // Untested and no-power pixels stay visible in the trend
                // data, one NaN row per commanded level.
                for commanded in self.report.settings.commanded_levels_watts() {
                    writer.write_record([
                        date.as_str(),
                        self.session.machine_id.as_str(),
                        self.session.factory_id.as_str(),
                        self.report.settings.test_type.export_label(),
                        &outcome.pixel.to_string(),
                        &rack.to_string(),
                        &laser.to_string(),
                        "REJECT",
                        outcome.status.label(),
                        &format!("{commanded:.4}"),
                        "NaN",
                        "NaN",
                        "NaN",
                        "0",
                    ])?;
                }
                continue;
            }
            for level in levels {
                let commanded = level[0].commanded_watts;
                let powers: Vec<f64> =
                    level.iter().map(|p| p.energy_joules / pulse_on).collect();
                let n = powers.len() as f64;
                let mean = powers.iter().sum::<f64>() / n;
                let var = powers.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
                let deviation = percent_diff(mean, commanded);
                // The process team's acceptance band is tighter than the
                // test tolerance: 5 % deviation at every level.
                let acceptance = if deviation < 5.0 { "ACCEPT" } else { "REJECT" };
                writer.write_record([
                    date.as_str(),
                    self.session.machine_id.as_str(),
                    self.session.factory_id.as_str(),
                    self.report.settings.test_type.export_label(),
                    &outcome.pixel.to_string(),
                    &rack.to_string(),
                    &laser.to_string(),
                    acceptance,
                    outcome.status.label(),
                    &format!("{commanded:.4}"),
                    &format!("{mean:.4}"),
                    &format!("{:.4}", var.sqrt()),
                    &format!("{deviation:.4}"),
                    &powers.len().to_string(),
                ])?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// `LUT_Coeff.csv`: fitted coefficients per pixel.
    pub fn write_coefficients(&self, calibration: &CalibrationSet) -> CalResult<()> {
        let mut writer = csv::Writer::from_path(self.dir.join("LUT_Coeff.csv"))?;
        writer.write_record(["Pixel", "Rack", "Laser", "a", "b", "c"])?;
        for cal in &calibration.pixels {
            writer.write_record([
                cal.pixel.to_string(),
                cal.rack.to_string(),
                cal.laser.to_string(),
                cal.coefficients.a.to_string(),
                cal.coefficients.b.to_string(),
                cal.coefficients.c.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// `LUT_Raw.csv`: the flattened per-bit audit table, one row per LUT
    /// entry per pixel.
    pub fn write_lut_audit(&self, calibration: &CalibrationSet) -> CalResult<()> {
        let mut writer = csv::Writer::from_path(self.dir.join("LUT_Raw.csv"))?;
        writer.write_record([
            "Timestamp",
            "Machine ID",
            "Factory ID",
            "Pixel",
            "Rack",
            "Laser",
            "Status",
            "a",
            "b",
            "c",
            "Bit",
            "Bit Power",
        ])?;
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        for cal in &calibration.pixels {
            let mut flags = vec![cal.status.label().to_string()];
            if cal.lut.power_scaled {
                flags.push("POWER SCALED".into());
            }
            if cal.lut.power_called_failure {
                flags.push("POWER CALLED FAILURE".into());
            }
            let status = flags.join("|");
            for (bit, &power) in cal.lut.entries.iter().enumerate() {
                writer.write_record([
                    stamp.as_str(),
                    self.session.machine_id.as_str(),
                    self.session.factory_id.as_str(),
                    &cal.pixel.to_string(),
                    &cal.rack.to_string(),
                    &cal.laser.to_string(),
                    &status,
                    &cal.coefficients.a.to_string(),
                    &cal.coefficients.b.to_string(),
                    &cal.coefficients.c.to_string(),
                    &bit.to_string(),
                    &power.to_string(),
                ])?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// `summary.csv`: counts and the contiguous ranges of passing pixels,
    /// followed by machine-wide means per commanded power level.
    pub fn write_summary(&self) -> CalResult<()> {
        let mut writer = csv::Writer::from_path(self.dir.join("summary.csv"))?;
        let passed: Vec<u32> = self
            .report
            .outcomes
            .iter()
            .filter(|o| o.status == PixelStatus::Passed)
            .map(|o| o.pixel)
            .collect();
        writer.write_record(["Pixels Tested", "Passed", "Failed", "Valid Pixel Ranges"])?;
        writer.write_record([
            self.report.outcomes.len().to_string(),
            passed.len().to_string(),
            (self.report.outcomes.len() - passed.len()).to_string(),
            pixel_ranges(&passed),
        ])?;

        let pulse_on = self.report.settings.pulse_on_secs();
        let mut groups: Vec<(f64, Vec<(f64, f64, f64)>)> = Vec::new();
        for outcome in &self.report.outcomes {
            for level in outcome.samples.split_levels() {
                let commanded = level[0].commanded_watts;
                let powers: Vec<f64> =
                    level.iter().map(|p| p.energy_joules / pulse_on).collect();
                let n = powers.len() as f64;
                let mean = powers.iter().sum::<f64>() / n;
                let var = powers.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
                let stats = (mean, var.sqrt(), percent_diff(mean, commanded));
                match groups.iter_mut().find(|(c, _)| *c == commanded) {
                    Some((_, list)) => list.push(stats),
                    None => groups.push((commanded, vec![stats])),
                }
            }
        }
        writer.write_record([
            "Commanded Power",
            "Total Power Average",
            "Total Average Power Stdv",
            "Total Average Power Deviation",
        ])?;
        for (commanded, stats) in &groups {
            let n = stats.len() as f64;
            let avg = |pick: fn(&(f64, f64, f64)) -> f64| stats.iter().map(pick).sum::<f64>() / n;
            writer.write_record([
                format!("{commanded:.3}"),
                format!("{:.3}", avg(|s| s.0)),
                format!("{:.3}", avg(|s| s.1)),
                format!("{:.3}", avg(|s| s.2)),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// `log.csv`: the settings the run was performed with.
    pub fn write_settings_log(&self) -> CalResult<()> {
        let mut writer = csv::Writer::from_path(self.dir.join("log.csv"))?;
        writer.write_record(["Setting", "Value"])?;
        writer.write_record(["Machine ID", &self.session.machine_id])?;
        writer.write_record(["Factory ID", &self.session.factory_id])?;
        writer.write_record(["Calibration ID", &self.report.settings.cal_id.to_string()])?;
        for (key, value) in self.report.settings.log_pairs() {
            writer.write_record([key, value])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Compress a sorted pixel list into `a-b` range notation.
fn pixel_ranges(pixels: &[u32]) -> String {
    let mut sorted = pixels.to_vec();
    sorted.sort_unstable();
    let mut ranges: Vec<String> = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;
    for pixel in iter {
        if pixel == end + 1 {
            end = pixel;
        } else {
            ranges.push(range_text(start, end));
            start = pixel;
            end = pixel;
        }
    }
    ranges.push(range_text(start, end));
    ranges.join(";")
}

fn range_text(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MeterSample;
    use crate::orchestrator::samples::RawSampleSet;
    use crate::orchestrator::settings::{TestSettings, TestType};
    use crate::orchestrator::PixelOutcome;

    fn session() -> SessionInfo {
        SessionInfo {
            machine_id: "DP1".into(),
            factory_id: "V1".into(),
        }
    }

    fn report() -> RunReport {
        let mut settings = TestSettings::defaults(TestType::CleanPowerVerification);
        settings.pixel_list = vec![1, 2];
        let mut good = RawSampleSet::new(1);
        good.ingest(49.4, &[MeterSample::clean(49.4 * 0.005, 0.0)]);
        RunReport {
            settings,
            outcomes: vec![
                PixelOutcome {
                    pixel: 1,
                    samples: good,
                    status: PixelStatus::Passed,
                },
                PixelOutcome {
                    pixel: 2,
                    samples: RawSampleSet::new(2),
                    status: PixelStatus::NoPowerFailure,
                },
            ],
            calibration: None,
            aborted: false,
        }
    }

    #[test]
    fn pixel_ranges_compress() {
        assert_eq!(pixel_ranges(&[]), "");
        assert_eq!(pixel_ranges(&[3]), "3");
        assert_eq!(pixel_ranges(&[1, 2, 3, 5, 7, 8]), "1-3;5;7-8");
    }

    #[test]
    fn raw_rows_are_rectangular() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session();
        let report = report();
        let map = PixelMap::sequential(84, 21);
        let exporter = RunExporter::new(tmp.path(), &session, &report, &map);
        exporter.write_raw().unwrap();

        let text = fs::read_to_string(tmp.path().join("LPM_Raw.csv")).unwrap();
        let widths: Vec<usize> = text
            .lines()
            .map(|line| line.split(',').count())
            .collect();
        assert_eq!(widths, vec![3, 3]);
        assert!(text.lines().nth(1).unwrap().starts_with("2,4,0"));
    }

    #[test]
    fn processed_rows_carry_the_contract_columns() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session();
        let report = report();
        let map = PixelMap::sequential(84, 21);
        let exporter = RunExporter::new(tmp.path(), &session, &report, &map);
        exporter.write_processed().unwrap();

        let text = fs::read_to_string(tmp.path().join("LPM_processed.csv")).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(header.split(',').count(), 14);
        let row = text.lines().nth(1).unwrap();
        assert!(row.contains("ACCEPT"));
        assert!(row.contains("CVER"));
    }

    #[test]
    fn empty_pixels_still_get_processed_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session();
        let report = report();
        let map = PixelMap::sequential(84, 21);
        RunExporter::new(tmp.path(), &session, &report, &map)
            .write_processed()
            .unwrap();

        let text = fs::read_to_string(tmp.path().join("LPM_processed.csv")).unwrap();
        let rows: Vec<&str> = text.lines().skip(1).collect();
        // Pixel 1 captured one level; pixel 2 captured nothing and gets a
        // placeholder row per commanded level.
        assert_eq!(rows.len(), 3);
        for row in &rows[1..] {
            assert!(row.contains("NO POWER FAILURE"), "{row}");
            assert!(row.contains("REJECT"), "{row}");
            assert!(row.contains("NaN"), "{row}");
        }
    }

    #[test]
    fn summary_groups_by_commanded_power() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session();
        let report = report();
        let map = PixelMap::sequential(84, 21);
        RunExporter::new(tmp.path(), &session, &report, &map)
            .write_summary()
            .unwrap();

        let text = fs::read_to_string(tmp.path().join("summary.csv")).unwrap();
        assert!(text.lines().nth(1).unwrap().starts_with("2,1,1,1"));
        assert!(text.contains("Commanded Power"));
        assert!(text.contains("49.400,49.400,0.000,0.000"));
    }

    #[test]
    fn acceptance_tracks_per_level_deviation() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session();
        let mut settings = TestSettings::defaults(TestType::Calibration);
        settings.pixel_list = vec![1];
        // First level dead on, second level 10 % low: within the 50 %
        // test tolerance but outside the 5 % process band.
        let mut samples = RawSampleSet::new(1);
        samples.ingest(49.4, &[MeterSample::clean(49.4 * 0.005, 0.0)]);
        samples.ingest(59.7, &[MeterSample::clean(59.7 * 0.9 * 0.005, 0.0)]);
        let report = RunReport {
            settings,
            outcomes: vec![PixelOutcome {
                pixel: 1,
                samples,
                status: PixelStatus::Passed,
            }],
            calibration: None,
            aborted: false,
        };
        let map = PixelMap::sequential(84, 21);
        RunExporter::new(tmp.path(), &session, &report, &map)
            .write_processed()
            .unwrap();

        let text = fs::read_to_string(tmp.path().join("LPM_processed.csv")).unwrap();
        let rows: Vec<&str> = text.lines().skip(1).collect();
        assert!(rows[0].contains("ACCEPT"));
        assert!(rows[1].contains("REJECT"));
    }

    #[test]
    fn calibration_dirs_get_collision_suffixes() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session();
        let settings = {
            let mut s = TestSettings::defaults(TestType::Calibration);
            s.pixel_list = vec![1];
            s
        };
        // Calibration directory names carry only the date, so a same-day
        // re-run always collides.
        let first = create_run_dir(tmp.path(), &session, &settings).unwrap();
        let second = create_run_dir(tmp.path(), &session, &settings).unwrap();
        let third = create_run_dir(tmp.path(), &session, &settings).unwrap();
        assert!(first.starts_with(tmp.path().join("30_Calibrations")));
        assert!(first.to_string_lossy().contains("DP01_LUT_99999_"));
        assert!(second.to_string_lossy().ends_with("_01"));
        assert!(third.to_string_lossy().ends_with("_02"));
    }

    #[test]
    fn verification_dirs_live_under_verifications() {
        let tmp = tempfile::tempdir().unwrap();
        let session = session();
        let settings = {
            let mut s = TestSettings::defaults(TestType::DirtyPowerVerification);
            s.pixel_list = vec![1];
            s
        };
        let dir = create_run_dir(tmp.path(), &session, &settings).unwrap();
        assert!(dir.starts_with(tmp.path().join("40_Verifications")));
        assert!(dir.to_string_lossy().ends_with("_DVER"));
    }
}
