//! Simulated controller.
//!
//! Plays the controller's half of the protocol against a [`MockPlc`]: it
//! validates the pushed configuration, walks the pixel list, issues the
//! initialize/capture/process commands with proper handshakes, and feeds the
//! mock meter ideal pulse energies so a simulated calibration converges on
//! the identity curve. Used by simulation mode and the integration tests.

use crate::instrument::{MeterSample, MockPowerMeter};
use crate::orchestrator::handshake::Command;
use crate::tags::{MockPlc, TagId, TagValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const POLL: Duration = Duration::from_millis(5);

/// Seed the controller-side tags a freshly connected session expects.
pub fn seed_idle_controller(plc: &MockPlc, machine: &str, factory: &str) {
    plc.seed(TagId::ReadyToConfigure.node_path(), TagValue::Bool(true));
    plc.seed(TagId::ReadyToTest.node_path(), TagValue::Bool(true));
    plc.seed(TagId::TestStatus.node_path(), TagValue::Int(0));
    plc.seed(TagId::ErrorNum.node_path(), TagValue::Int(0));
    plc.seed(TagId::ConfigValid.node_path(), TagValue::Bool(false));
    plc.seed(TagId::ActivePixel.node_path(), TagValue::Int(0));
    plc.seed(TagId::HeartbeatOut.node_path(), TagValue::Int(0));
    plc.seed(TagId::CurrentLutId.node_path(), TagValue::Int(0));
    plc.seed(TagId::MachineName.node_path(), TagValue::Text(machine.into()));
    plc.seed(TagId::FactoryName.node_path(), TagValue::Text(factory.into()));
    for cmd in Command::ALL {
        plc.seed(cmd.command_tag().node_path(), TagValue::Bool(false));
    }
    for tag in crate::telemetry::MONITOR_TAGS {
        plc.seed(tag.node_path(), TagValue::Float(21.0));
    }
    plc.declare_array(TagId::PixelList.node_path(), 84);
}

async fn wait_bool(plc: &MockPlc, tag: TagId, level: bool) {
    loop {
        let current = plc
            .node_value(tag.node_path())
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if current == level {
            return;
        }
        tokio::time::sleep(POLL).await;
    }
}

fn read_f64(plc: &MockPlc, tag: TagId) -> f64 {
    plc.node_value(tag.node_path())
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
}

fn read_i64(plc: &MockPlc, tag: TagId) -> i64 {
    plc.node_value(tag.node_path())
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}

/// Assert a command, wait for its acknowledgement, then release it and wait
/// for the response to clear.
async fn handshake(plc: &MockPlc, cmd: Command) {
    plc.push_change(cmd.command_tag().node_path(), TagValue::Bool(true));
    wait_bool(plc, cmd.response_tag(), true).await;
    plc.push_change(cmd.command_tag().node_path(), TagValue::Bool(false));
    wait_bool(plc, cmd.response_tag(), false).await;
}

/// How the simulated lasers respond to commanded power.
#[derive(Debug, Clone, Copy)]
pub enum LaserResponse {
    /// Delivered power equals commanded power.
    Ideal,
    /// Delivered power is a fixed multiple of commanded power.
    Scaled(f64),
    /// The laser never fires.
    Dead,
}

impl LaserResponse {
    fn energy(self, commanded_watts: f64, pulse_on_secs: f64) -> f64 {
        match self {
            LaserResponse::Ideal => commanded_watts * pulse_on_secs,
            LaserResponse::Scaled(k) => k * commanded_watts * pulse_on_secs,
            LaserResponse::Dead => 0.0,
        }
    }
}

/// Run the controller's side of one full test sequence.
pub fn spawn(
    plc: Arc<MockPlc>,
    meter: Arc<MockPowerMeter>,
    response: LaserResponse,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_bool(&plc, TagId::ConfigurationSent, true).await;
        plc.push_change(TagId::ConfigValid.node_path(), TagValue::Bool(true));
        debug!("configuration accepted");

        wait_bool(&plc, TagId::BeginTest, true).await;
        let starting = read_f64(&plc, TagId::StartingPowerLevel);
        let increment = read_f64(&plc, TagId::PowerLevelIncrement);
        let steps = read_i64(&plc, TagId::NumPowerLevelSteps).max(1) as usize;
        let pulses = read_i64(&plc, TagId::NumPulsesPerLevel).max(1) as usize;
        let available = read_f64(&plc, TagId::AvailableLaserPowerWatts);
        let pulse_on_secs = read_f64(&plc, TagId::PulseOnMsec) / 1000.0;
        let num_pixels = read_i64(&plc, TagId::NumPixelsToTest) as usize;

        for tested in 0..num_pixels {
            // The application selects the pixel; the gantry "moves" there.
            if tested > 0 {
                wait_bool(&plc, TagId::ProceedToNextPixel, true).await;
            }
            let pixel = read_i64(&plc, TagId::TestPixel);
            plc.push_change(TagId::ActivePixel.node_path(), TagValue::Int(pixel));

            handshake(&plc, Command::InitializePixel).await;

            // Fire the pulse train into the meter buffer.
            let mut batch = Vec::new();
            for step in 0..steps {
                let watts = (starting + step as f64 * increment) * available / 255.0;
                for pulse in 0..pulses {
                    batch.push(MeterSample::clean(
                        response.energy(watts, pulse_on_secs),
                        (step * pulses + pulse) as f64 * 0.063,
                    ));
                }
            }
            meter.queue_batch(batch);

            handshake(&plc, Command::CapturePixel).await;
            handshake(&plc, Command::ProcessPixel).await;
            debug!(
                pixel,
                result = read_i64(&plc, TagId::PixelResult),
                "pixel sequence done"
            );
        }

        wait_bool(&plc, TagId::TestComplete, true).await;
        info!(pixels = num_pixels, "simulated test sequence complete");
    })
}
