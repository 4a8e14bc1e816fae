//! Power-meter instrument seam.
//!
//! The physical meter streams (energy, timestamp, status) triples; pulses
//! with a non-zero status word are known noise and get discarded upstream.
//! The concrete USB driver lives outside this crate; tests and simulation
//! use [`MockPowerMeter`].

use crate::error::{CalError, CalResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// One raw sample from the meter stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterSample {
    /// Pulse energy in joules.
    pub energy_joules: f64,
    /// Instrument timestamp, seconds since stream start.
    pub timestamp: f64,
    /// Instrument status word; zero means a clean reading.
    pub status: u32,
}

impl MeterSample {
    pub fn clean(energy_joules: f64, timestamp: f64) -> Self {
        Self {
            energy_joules,
            timestamp,
            status: 0,
        }
    }
}

/// Driver surface for the external power/energy meter.
#[async_trait]
pub trait PowerMeter: Send + Sync {
    fn name(&self) -> String;

    /// Begin streaming samples into the instrument buffer.
    async fn start_streaming(&self) -> CalResult<()>;

    /// Stop streaming.
    async fn stop_streaming(&self) -> CalResult<()>;

    /// Discard everything currently buffered.
    async fn clear_buffer(&self) -> CalResult<()>;

    /// Drain and return everything buffered since the last clear.
    async fn get_all_samples(&self) -> CalResult<Vec<MeterSample>>;
}

#[derive(Default)]
struct MockMeterState {
    streaming: bool,
    /// One batch per `get_all_samples` call.
    batches: VecDeque<Vec<MeterSample>>,
    fail_start: bool,
}

/// Scripted meter used by tests and simulation mode.
pub struct MockPowerMeter {
    state: Mutex<MockMeterState>,
}

impl Default for MockPowerMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPowerMeter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockMeterState::default()),
        }
    }

    /// Queue one batch of samples to be returned by the next
    /// `get_all_samples` call.
    pub fn queue_batch(&self, samples: Vec<MeterSample>) {
        self.state.lock().batches.push_back(samples);
    }

    /// Queue a single clean pulse as its own batch.
    pub fn queue_pulse(&self, energy_joules: f64) {
        self.queue_batch(vec![MeterSample::clean(energy_joules, 0.0)]);
    }

    /// Make the next `start_streaming` fail (disconnected instrument).
    pub fn fail_next_start(&self) {
        self.state.lock().fail_start = true;
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }
}

#[async_trait]
impl PowerMeter for MockPowerMeter {
    fn name(&self) -> String {
        "Mock Power Meter".to_string()
    }

    async fn start_streaming(&self) -> CalResult<()> {
        let mut state = self.state.lock();
        if state.fail_start {
            state.fail_start = false;
            return Err(CalError::Capture("meter not connected".into()));
        }
        state.streaming = true;
        Ok(())
    }

    async fn stop_streaming(&self) -> CalResult<()> {
        self.state.lock().streaming = false;
        Ok(())
    }

    async fn clear_buffer(&self) -> CalResult<()> {
        Ok(())
    }

    async fn get_all_samples(&self) -> CalResult<Vec<MeterSample>> {
        let mut state = self.state.lock();
        if !state.streaming {
            return Err(CalError::Capture("meter is not streaming".into()));
        }
        Ok(state.batches.pop_front().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_batches_come_back_in_order() {
        let meter = MockPowerMeter::new();
        meter.queue_pulse(0.25);
        meter.queue_pulse(0.30);
        meter.start_streaming().await.unwrap();
        assert_eq!(
            meter.get_all_samples().await.unwrap(),
            vec![MeterSample::clean(0.25, 0.0)]
        );
        assert_eq!(
            meter.get_all_samples().await.unwrap(),
            vec![MeterSample::clean(0.30, 0.0)]
        );
        // Exhausted script yields an empty read, not an error.
        assert!(meter.get_all_samples().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sampling_without_streaming_is_a_capture_failure() {
        let meter = MockPowerMeter::new();
        assert!(matches!(
            meter.get_all_samples().await,
            Err(CalError::Capture(_))
        ));
    }
}
