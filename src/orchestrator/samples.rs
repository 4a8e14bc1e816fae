//! Raw pulse data collected for one pixel.

use crate::instrument::MeterSample;
use serde::{Deserialize, Serialize};

/// One retained pulse: the commanded power when it fired and the measured
/// energy it delivered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseRecord {
    pub commanded_watts: f64,
    pub energy_joules: f64,
    pub timestamp: f64,
}

/// Everything captured for one pixel, in pulse order.
#[derive(Debug, Clone, Default)]
pub struct RawSampleSet {
    pub pixel: u32,
    pulses: Vec<PulseRecord>,
    /// Pulses discarded because the meter flagged them.
    pub discarded: usize,
}

impl RawSampleSet {
    pub fn new(pixel: u32) -> Self {
        Self {
            pixel,
            ..Self::default()
        }
    }

    /// Ingest one meter batch fired at the given commanded power, keeping
    /// clean pulses and counting flagged ones.
    pub fn ingest(&mut self, commanded_watts: f64, samples: &[MeterSample]) {
        for sample in samples {
            if sample.status != 0 {
                self.discarded += 1;
                continue;
            }
            self.pulses.push(PulseRecord {
                commanded_watts,
                energy_joules: sample.energy_joules,
                timestamp: sample.timestamp,
            });
        }
    }

    pub fn pulses(&self) -> &[PulseRecord] {
        &self.pulses
    }

    pub fn is_empty(&self) -> bool {
        self.pulses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pulses.len()
    }

    /// Drop zero-energy padding the meter appends at either end of the
    /// buffer. Interior zeros are real dropouts and stay.
    pub fn trim_zero_padding(&mut self) {
        while self
            .pulses
            .first()
            .is_some_and(|p| p.energy_joules == 0.0)
        {
            self.pulses.remove(0);
        }
        while self
            .pulses
            .last()
            .is_some_and(|p| p.energy_joules == 0.0)
        {
            self.pulses.pop();
        }
    }

    /// Group retained pulses into power levels.
    ///
    /// A new level starts at every strict increase in commanded power, which
    /// is how the run sequences levels; equal or lower commanded values stay
    /// in the current level.
    pub fn split_levels(&self) -> Vec<Vec<PulseRecord>> {
        let mut levels: Vec<Vec<PulseRecord>> = Vec::new();
        let mut last_commanded = f64::NEG_INFINITY;
        for pulse in &self.pulses {
            if pulse.commanded_watts > last_commanded || levels.is_empty() {
                levels.push(Vec::new());
            }
            last_commanded = pulse.commanded_watts;
            if let Some(level) = levels.last_mut() {
                level.push(*pulse);
            }
        }
        levels
    }

    /// Mean measured energy per level, in pulse order.
    pub fn level_mean_energies(&self) -> Vec<f64> {
        self.split_levels()
            .iter()
            .map(|level| {
                level.iter().map(|p| p.energy_joules).sum::<f64>() / level.len() as f64
            })
            .collect()
    }
}
