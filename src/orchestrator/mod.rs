//! Test orchestration.
//!
//! The orchestrator is the application side of the controller's test
//! sequence. It pushes the run configuration, answers the controller's
//! per-pixel commands over the handshake tags, collects meter samples,
//! classifies each pixel against the tolerance band, and hands the
//! captured buffers to the calibration engine when the run ends.
//!
//! All controller input reaches the orchestrator as [`OrchestratorEvent`]s
//! forwarded by tag reactions into one mpsc channel; the run loop in
//! [`TestOrchestrator::run`] is the only consumer, so handlers never race.

pub mod handshake;
pub mod samples;
pub mod settings;
pub mod status;

use crate::calib::{CalibrationEngine, CalibrationSet};
use crate::error::{CalError, CalResult, ConfigErrorCode};
use crate::instrument::PowerMeter;
use crate::pixel::PixelMap;
use crate::tags::{TagId, TagRegistry, TagValue};
use handshake::{Command, Handshake, HandshakeAction};
use samples::RawSampleSet;
use settings::{TestMode, TestSettings};
use status::{PixelStatus, StatusEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Tags kept live for the whole session.
pub const SESSION_TAGS: &[TagId] = &[
    TagId::ReadyToConfigure,
    TagId::ReadyToTest,
    TagId::TestStatus,
    TagId::ErrorNum,
    TagId::CurrentLutId,
    TagId::ConfigValid,
    TagId::ActivePixel,
    TagId::HeartbeatOut,
    TagId::InitializePixel,
    TagId::CapturePixel,
    TagId::ProcessPixel,
];

/// Time the gantry is allowed to take to reach a commanded pixel.
const MOVE_TIMEOUT: Duration = Duration::from_secs(3);

/// Time the controller is allowed to take to validate a configuration.
const CONFIG_TIMEOUT: Duration = Duration::from_secs(5);

/// Measured power below this fraction of expected counts as no power.
const NO_POWER_FRACTION: f64 = 0.05;

/// Controller input, forwarded from tag reactions.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    CommandLevel(Command, bool),
    ActivePixel(i64),
    Status(StatusEvent),
    ConfigValid(bool),
    ErrorCode(i64),
    Heartbeat(i64),
    /// Operator confirmation to move past a failed pixel in semi-auto mode.
    ProceedConfirmed,
    /// Operator-requested abort.
    Abort,
}

/// One pixel's outcome in the run report.
#[derive(Debug, Clone)]
pub struct PixelOutcome {
    pub pixel: u32,
    pub samples: RawSampleSet,
    pub status: PixelStatus,
}

/// Everything a finished (or aborted) run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub settings: TestSettings,
    pub outcomes: Vec<PixelOutcome>,
    /// Present for calibration runs, aborted ones included.
    pub calibration: Option<CalibrationSet>,
    pub aborted: bool,
}

impl RunReport {
    pub fn passed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == PixelStatus::Passed)
            .count()
    }
}

/// Drives one test run against the controller.
pub struct TestOrchestrator {
    registry: Arc<TagRegistry>,
    meter: Arc<dyn PowerMeter>,
    settings: TestSettings,
    pixel_map: PixelMap,
    events: mpsc::UnboundedReceiver<OrchestratorEvent>,

    handshakes: HashMap<Command, Handshake>,
    /// Index into `settings.pixel_list` of the pixel under test.
    cursor: usize,
    active_pixel: i64,
    /// Deadline for an in-flight gantry move, when one is pending.
    move_deadline: Option<Instant>,
    /// Semi-auto hold: a failed pixel is parked until the operator confirms.
    awaiting_confirmation: bool,
    current: Option<RawSampleSet>,
    outcomes: Vec<PixelOutcome>,
    aborted: bool,
    complete: bool,
}

impl TestOrchestrator {
    /// Wire the orchestrator to a registry: subscribe the session tags and
    /// attach the reactions that forward controller input into the event
    /// channel.
    pub async fn connect(
        registry: Arc<TagRegistry>,
        meter: Arc<dyn PowerMeter>,
        settings: TestSettings,
        pixel_map: PixelMap,
    ) -> CalResult<(Self, mpsc::UnboundedSender<OrchestratorEvent>)> {
        settings.validate(pixel_map.len())?;
        registry.subscribe_all(SESSION_TAGS).await?;

        let (tx, events) = mpsc::unbounded_channel();
        Self::attach_reactions(&registry, &tx);

        Ok((
            Self {
                registry,
                meter,
                settings,
                pixel_map,
                events,
                handshakes: Command::ALL
                    .iter()
                    .map(|&c| (c, Handshake::default()))
                    .collect(),
                cursor: 0,
                active_pixel: 0,
                move_deadline: None,
                awaiting_confirmation: false,
                current: None,
                outcomes: Vec::new(),
                aborted: false,
                complete: false,
            },
            tx,
        ))
    }

    fn attach_reactions(
        registry: &TagRegistry,
        tx: &mpsc::UnboundedSender<OrchestratorEvent>,
    ) {
        for &cmd in Command::ALL {
            let tx = tx.clone();
            registry.attach_reaction(cmd.command_tag(), "orchestrator", move |value| {
                let _ = tx.send(OrchestratorEvent::CommandLevel(
                    cmd,
                    value.as_bool().unwrap_or(false),
                ));
            });
        }
        let fwd_i64 = |tx: mpsc::UnboundedSender<OrchestratorEvent>,
                       make: fn(i64) -> OrchestratorEvent| {
            move |value: &TagValue| {
                if let Some(v) = value.as_i64() {
                    let _ = tx.send(make(v));
                }
            }
        };
        registry.attach_reaction(
            TagId::ActivePixel,
            "orchestrator",
            fwd_i64(tx.clone(), OrchestratorEvent::ActivePixel),
        );
        registry.attach_reaction(
            TagId::ErrorNum,
            "orchestrator",
            fwd_i64(tx.clone(), OrchestratorEvent::ErrorCode),
        );
        registry.attach_reaction(
            TagId::HeartbeatOut,
            "orchestrator",
            fwd_i64(tx.clone(), OrchestratorEvent::Heartbeat),
        );
        let status_tx = tx.clone();
        registry.attach_reaction(TagId::TestStatus, "orchestrator", move |value| {
            if let Some(event) = value.as_i64().and_then(StatusEvent::from_code) {
                let _ = status_tx.send(OrchestratorEvent::Status(event));
            }
        });
        let valid_tx = tx.clone();
        registry.attach_reaction(TagId::ConfigValid, "orchestrator", move |value| {
            let _ = valid_tx.send(OrchestratorEvent::ConfigValid(
                value.as_bool().unwrap_or(false),
            ));
        });
    }

    fn expected_pixel(&self) -> u32 {
        self.settings.pixel_list[self.cursor]
    }

    /// Push the run configuration and wait for the controller's verdict.
    async fn configure(&mut self) -> CalResult<()> {
        let ready = self.registry.read(TagId::ReadyToConfigure).await?;
        if !ready.as_bool().unwrap_or(false) {
            return Err(CalError::Configuration(
                "controller is not ready to configure".into(),
            ));
        }

        let s = &self.settings;
        let writes: &[(TagId, TagValue)] = &[
            (TagId::PulseDelayMsec, s.pulse_delay_msec.into()),
            (TagId::PulseOnMsec, s.pulse_on_msec.into()),
            (TagId::PulseOffMsec, s.pulse_off_msec.into()),
            (
                TagId::NumPulsesPerLevel,
                TagValue::Int(s.num_pulses_per_level as i64),
            ),
            (
                TagId::AvailableLaserPowerWatts,
                s.available_laser_power_watts.into(),
            ),
            (TagId::SafePowerLimitWatts, s.safe_power_limit_watts.into()),
            (TagId::StartingPowerLevel, s.starting_power_level.into()),
            (
                TagId::NumPowerLevelSteps,
                TagValue::Int(s.num_power_level_steps as i64),
            ),
            (TagId::PowerLevelIncrement, s.power_level_increment.into()),
            (TagId::ToleranceBandPercent, s.tolerance_percent.into()),
            (TagId::TestType, TagValue::Int(s.test_type.controller_code())),
            (
                TagId::PixelList,
                TagValue::IntArray(s.pixel_list.iter().map(|&p| i64::from(p)).collect()),
            ),
            (
                TagId::NumPixelsToTest,
                TagValue::Int(s.pixel_list.len() as i64),
            ),
        ];
        for (tag, value) in writes.iter().cloned() {
            self.registry.write(tag, value).await?;
        }
        self.registry
            .write(TagId::ConfigurationSent, TagValue::Bool(true))
            .await?;
        info!(pixels = self.settings.pixel_list.len(), "configuration sent");

        let deadline = Instant::now() + CONFIG_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| {
                    CalError::Configuration("controller did not validate configuration".into())
                })?
                .ok_or_else(|| CalError::Connection("event channel closed".into()))?;
            match event {
                OrchestratorEvent::ConfigValid(true) => return Ok(()),
                OrchestratorEvent::ErrorCode(code) if code != 0 => {
                    let code = ConfigErrorCode::from_code(code).ok_or_else(|| {
                        CalError::Configuration(format!("unknown rejection code {code}"))
                    })?;
                    return Err(CalError::ConfigRejected(code));
                }
                other => debug!(?other, "event during configuration wait"),
            }
        }
    }

    /// Clear every response tag; run at start, abort, and teardown so the
    /// controller never sees a stale acknowledgement.
    async fn reset_response_tags(&mut self) -> CalResult<()> {
        for &cmd in Command::ALL {
            self.registry
                .write(cmd.response_tag(), TagValue::Bool(false))
                .await?;
        }
        self.registry
            .write(TagId::PixelResult, TagValue::Int(0))
            .await?;
        for hs in self.handshakes.values_mut() {
            hs.reset();
        }
        Ok(())
    }

    async fn begin(&mut self) -> CalResult<()> {
        let ready = self.registry.read(TagId::ReadyToTest).await?;
        if !ready.as_bool().unwrap_or(false) {
            return Err(CalError::Configuration(
                "controller is not ready to test".into(),
            ));
        }
        self.reset_response_tags().await?;
        self.registry
            .write(
                TagId::TestPixel,
                TagValue::Int(i64::from(self.expected_pixel())),
            )
            .await?;
        self.registry
            .write(TagId::BeginTest, TagValue::Bool(true))
            .await?;
        self.move_deadline = Some(Instant::now() + MOVE_TIMEOUT);
        info!(pixel = self.expected_pixel(), "test started");
        Ok(())
    }

    /// Run the configured test to completion and report what it produced.
    pub async fn run(mut self) -> CalResult<RunReport> {
        self.configure().await?;
        self.begin().await?;

        while !self.complete && !self.aborted {
            let deadline = self.move_deadline;
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle(event).await?,
                        None => {
                            return Err(CalError::Connection(
                                "event channel closed mid-run".into(),
                            ))
                        }
                    }
                }
                () = async {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                } => {
                    error!(
                        pixel = self.expected_pixel(),
                        "gantry did not reach the pixel in time"
                    );
                    self.abort("move timeout").await?;
                }
            }
        }

        self.finish().await
    }

    async fn handle(&mut self, event: OrchestratorEvent) -> CalResult<()> {
        match event {
            OrchestratorEvent::CommandLevel(cmd, level) => {
                let action = self
                    .handshakes
                    .get_mut(&cmd)
                    .map(|hs| hs.on_command_level(level))
                    .unwrap_or(HandshakeAction::None);
                match action {
                    HandshakeAction::Dispatch => self.dispatch(cmd).await?,
                    HandshakeAction::ClearResponse => {
                        self.registry
                            .write(cmd.response_tag(), TagValue::Bool(false))
                            .await?;
                    }
                    HandshakeAction::None => {}
                }
            }
            OrchestratorEvent::ActivePixel(pixel) => {
                self.active_pixel = pixel;
                if self.move_deadline.is_some() && pixel == i64::from(self.expected_pixel()) {
                    self.move_deadline = None;
                    self.registry
                        .write(TagId::ProceedToNextPixel, TagValue::Bool(false))
                        .await?;
                    debug!(pixel, "gantry in position");
                }
            }
            OrchestratorEvent::Status(StatusEvent::CriticalFault) => {
                error!("controller reported a critical fault");
                self.abort("critical fault").await?;
            }
            OrchestratorEvent::Status(_) => {}
            OrchestratorEvent::Heartbeat(v) => {
                self.registry
                    .write(TagId::HeartbeatIn, TagValue::Int(v + 1))
                    .await?;
            }
            OrchestratorEvent::ProceedConfirmed => {
                if self.awaiting_confirmation {
                    info!("operator confirmed; resuming");
                    self.awaiting_confirmation = false;
                    self.advance().await?;
                }
            }
            OrchestratorEvent::Abort => {
                info!("abort requested");
                self.abort("operator abort").await?;
            }
            OrchestratorEvent::ConfigValid(_) | OrchestratorEvent::ErrorCode(_) => {}
        }
        Ok(())
    }

    async fn dispatch(&mut self, cmd: Command) -> CalResult<()> {
        if let Some(hs) = self.handshakes.get_mut(&cmd) {
            hs.mark_busy();
        }
        let result = match cmd {
            Command::InitializePixel => self.handle_initialize().await,
            Command::CapturePixel => self.handle_capture().await,
            Command::ProcessPixel => self.handle_process().await,
        };
        match result {
            Ok(()) => {
                self.registry
                    .write(cmd.response_tag(), TagValue::Bool(true))
                    .await?;
                if let Some(hs) = self.handshakes.get_mut(&cmd) {
                    hs.mark_acknowledged();
                }
                Ok(())
            }
            Err(CalError::Capture(reason)) => {
                // Instrument trouble mid-run is unrecoverable for the test.
                error!(%reason, "instrument failure");
                self.abort(&reason).await
            }
            Err(other) => Err(other),
        }
    }

    /// `InitializePixel`: the gantry is in position; arm the meter.
    async fn handle_initialize(&mut self) -> CalResult<()> {
        let pixel = self.expected_pixel();
        if self.active_pixel != i64::from(pixel) {
            warn!(
                active = self.active_pixel,
                expected = pixel,
                "initialize for a pixel the gantry has not reported"
            );
        }
        self.meter.clear_buffer().await?;
        self.meter.start_streaming().await?;
        self.current = Some(RawSampleSet::new(pixel));
        debug!(pixel, "pixel initialized");
        Ok(())
    }

    /// `CapturePixel`: the pulse train is done; harvest the meter buffer.
    ///
    /// The buffer holds the whole train in firing order, so clean pulses are
    /// assigned to power levels positionally: the first
    /// `num_pulses_per_level` to the first level and so on, with any surplus
    /// folded into the last level.
    async fn handle_capture(&mut self) -> CalResult<()> {
        let raw = self.meter.get_all_samples().await?;
        let pixel = self.expected_pixel();
        let mut set = self
            .current
            .take()
            .unwrap_or_else(|| RawSampleSet::new(pixel));

        let per_level = self.settings.num_pulses_per_level;
        let last_step = self.settings.num_power_level_steps - 1;
        let mut clean_seen = 0usize;
        for sample in &raw {
            let step = (clean_seen / per_level).min(last_step);
            set.ingest(
                self.settings.commanded_level_watts(step),
                std::slice::from_ref(sample),
            );
            if sample.status == 0 {
                clean_seen += 1;
            }
        }
        set.trim_zero_padding();
        debug!(
            pixel,
            pulses = set.len(),
            discarded = set.discarded,
            "pixel captured"
        );
        self.current = Some(set);
        self.meter.stop_streaming().await?;
        Ok(())
    }

    /// `ProcessPixel`: classify the captured data, publish the result, and
    /// advance the run.
    async fn handle_process(&mut self) -> CalResult<()> {
        let pixel = self.expected_pixel();
        let samples = self
            .current
            .take()
            .unwrap_or_else(|| RawSampleSet::new(pixel));
        let status = self.classify(&samples);
        info!(pixel, status = status.label(), "pixel processed");

        self.registry
            .write(TagId::PixelResult, TagValue::Int(status.code()))
            .await?;
        self.outcomes.push(PixelOutcome {
            pixel,
            samples,
            status,
        });
        if status.is_failure() && self.settings.test_mode == TestMode::SemiAuto {
            // Park the run; the operator decides whether to continue.
            warn!(
                pixel,
                status = status.label(),
                "failure in semi-auto mode; waiting for operator confirmation"
            );
            self.awaiting_confirmation = true;
            return Ok(());
        }
        self.advance().await
    }

    /// Tolerance classification for one pixel's captured data.
    ///
    /// Every kept pulse is judged on its own: under the no-power floor
    /// first (it sits inside the low-tolerance band, so it has to win),
    /// then against the tolerance bounds. The pixel passes only if every
    /// pulse passed; otherwise it takes the last failure seen. An empty
    /// capture is no power by definition.
    fn classify(&self, samples: &RawSampleSet) -> PixelStatus {
        if samples.is_empty() {
            return PixelStatus::NoPowerFailure;
        }
        let pulse_on = self.settings.pulse_on_secs();
        let tol = self.settings.tolerance_percent / 100.0;
        let mut status = PixelStatus::Passed;
        for pulse in samples.pulses() {
            let expected = pulse.commanded_watts;
            let measured = pulse.energy_joules / pulse_on;
            if measured < NO_POWER_FRACTION * expected {
                status = PixelStatus::NoPowerFailure;
            } else if measured > expected * (1.0 + tol) {
                status = PixelStatus::HighPowerFailure;
            } else if measured < expected * (1.0 - tol) {
                status = PixelStatus::LowPowerFailure;
            }
        }
        status
    }

    /// Move on to the next pixel, or wrap the run up.
    async fn advance(&mut self) -> CalResult<()> {
        self.cursor += 1;
        if self.cursor >= self.settings.pixel_list.len() {
            self.complete = true;
            return Ok(());
        }
        self.registry
            .write(
                TagId::TestPixel,
                TagValue::Int(i64::from(self.expected_pixel())),
            )
            .await?;
        self.registry
            .write(TagId::ProceedToNextPixel, TagValue::Bool(true))
            .await?;
        self.move_deadline = Some(Instant::now() + MOVE_TIMEOUT);
        Ok(())
    }

    /// Stop the run. The pixel in flight keeps its captured data and stays
    /// untested; everything after it is marked aborted.
    async fn abort(&mut self, reason: &str) -> CalResult<()> {
        warn!(%reason, "aborting test");
        self.aborted = true;
        self.move_deadline = None;
        self.registry
            .write(TagId::AbortTest, TagValue::Bool(true))
            .await?;
        if let Err(err) = self.meter.stop_streaming().await {
            warn!(%err, "meter did not stop cleanly");
        }
        let current = self.current.take();
        if self.cursor < self.settings.pixel_list.len() {
            let pixel = self.expected_pixel();
            self.outcomes.push(PixelOutcome {
                pixel,
                samples: current.unwrap_or_else(|| RawSampleSet::new(pixel)),
                status: PixelStatus::Untested,
            });
        }
        for &pixel in &self.settings.pixel_list[(self.cursor + 1).min(self.settings.pixel_list.len())..] {
            self.outcomes.push(PixelOutcome {
                pixel,
                samples: RawSampleSet::new(pixel),
                status: PixelStatus::Aborted,
            });
        }
        Ok(())
    }

    async fn finish(&mut self) -> CalResult<RunReport> {
        // An aborted run announced itself on `AbortTest` already; the
        // completion signal is reserved for clean finishes.
        if !self.aborted {
            self.registry
                .write(TagId::TestComplete, TagValue::Bool(true))
                .await?;
        }
        self.reset_response_tags().await?;
        if let Err(err) = self.meter.stop_streaming().await {
            warn!(%err, "meter did not stop cleanly");
        }

        // Calibration runs produce curves even when aborted, so whatever
        // was captured is never silently lost; failed and unreached pixels
        // carry the identity line anyway.
        let calibration = if self.settings.test_type.is_calibration() {
            let engine = CalibrationEngine::new(&self.settings, &self.pixel_map);
            let captured: Vec<(RawSampleSet, PixelStatus)> = self
                .outcomes
                .iter()
                .map(|o| (o.samples.clone(), o.status))
                .collect();
            Some(engine.calibrate(&captured)?)
        } else {
            None
        };

        info!(
            pixels = self.outcomes.len(),
            aborted = self.aborted,
            "run finished"
        );
        Ok(RunReport {
            settings: self.settings.clone(),
            outcomes: std::mem::take(&mut self.outcomes),
            calibration,
            aborted: self.aborted,
        })
    }
}
