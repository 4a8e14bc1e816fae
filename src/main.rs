//! CLI entry point.
//!
//! Two subcommands cover the operational surface:
//! - `run` performs a full test (calibration or verification) end to end:
//!   configure, test every pixel, export artifacts, and for calibration runs
//!   upload the encoded LUTs.
//! - `upload-linear` pushes identity LUTs to every rack as a safe baseline.
//!
//! With `plc.simulation = true` in the config, a scripted controller and a
//! mock meter stand in for the hardware, which is how the sequence is
//! exercised on a desk.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use laser_cal::config::{SessionInfo, Settings};
use laser_cal::export::{create_run_dir, RunExporter};
use laser_cal::instrument::{MockPowerMeter, PowerMeter};
use laser_cal::orchestrator::settings::{TestMode, TestSettings, TestType};
use laser_cal::orchestrator::{OrchestratorEvent, TestOrchestrator};
use laser_cal::pixel::PixelMap;
use laser_cal::sim;
use laser_cal::tags::{MockPlc, TagRegistry};
use laser_cal::telemetry;
use laser_cal::upload::{MockRack, RackEndpoint, UploadPipeline};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "laser-cal")]
#[command(about = "Automated laser power calibration", long_about = None)]
struct Cli {
    /// Named config under config/ (defaults to `default`).
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test sequence end to end.
    Run {
        /// Kind of test to perform.
        #[arg(long, value_enum, default_value_t = TestKind::Cal)]
        test: TestKind,

        /// Pixels to test, e.g. `1,2,5` (defaults to every mapped pixel).
        #[arg(long)]
        pixels: Option<String>,

        /// Advance past failed pixels without stopping.
        #[arg(long)]
        continuous: bool,
    },

    /// Push identity LUTs to every rack controller.
    UploadLinear,
}

#[derive(Clone, Copy, ValueEnum)]
enum TestKind {
    Cal,
    Cver,
    Dver,
    Lowpower,
}

impl From<TestKind> for TestType {
    fn from(kind: TestKind) -> Self {
        match kind {
            TestKind::Cal => TestType::Calibration,
            TestKind::Cver => TestType::CleanPowerVerification,
            TestKind::Dver => TestType::DirtyPowerVerification,
            TestKind::Lowpower => TestType::LowPowerCheck,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref()).context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    if !settings.plc.simulation {
        // The OPC UA and rack file-transfer sessions are provided by the
        // machine-side deployment; the desk build only ships the simulator.
        bail!("only simulation mode is available in this build");
    }

    match cli.command {
        Commands::Run {
            test,
            pixels,
            continuous,
        } => run_test(&settings, test.into(), pixels, continuous).await,
        Commands::UploadLinear => upload_linear(&settings).await,
    }
}

fn parse_pixel_list(text: &str) -> Result<Vec<u32>> {
    text.split(',')
        .map(|s| {
            s.trim()
                .parse::<u32>()
                .with_context(|| format!("bad pixel index '{s}'"))
        })
        .collect()
}

fn mock_racks(settings: &Settings) -> Vec<Arc<dyn RackEndpoint>> {
    (1..=settings.machine.rack_ips.len())
        .map(|rack| MockRack::new(rack as u8) as Arc<dyn RackEndpoint>)
        .collect()
}

async fn run_test(
    settings: &Settings,
    test_type: TestType,
    pixels: Option<String>,
    continuous: bool,
) -> Result<()> {
    let pixel_map = PixelMap::sequential(
        settings.machine.num_pixels,
        settings.machine.lasers_per_rack,
    );

    let mut test_settings = TestSettings::defaults(test_type);
    test_settings.pixel_list = match pixels {
        Some(text) => parse_pixel_list(&text)?,
        None => pixel_map.channels().iter().map(|c| c.pixel).collect(),
    };
    if continuous {
        test_settings.test_mode = TestMode::Continuous;
    }

    let (plc, changes) = MockPlc::new();
    sim::seed_idle_controller(&plc, "DP1", "VulcanOne");
    let meter = Arc::new(MockPowerMeter::new());
    let controller = sim::spawn(plc.clone(), meter.clone(), sim::LaserResponse::Ideal);

    let registry = Arc::new(TagRegistry::new(
        plc,
        Duration::from_millis(settings.plc.sampling_interval_ms),
    ));
    let pump = tokio::spawn(registry.clone().run(changes));

    let session = SessionInfo::from_registry(&registry).await?;
    info!(
        machine = %session.machine_id,
        factory = %session.factory_id,
        "session established"
    );

    let run_dir = create_run_dir(Path::new(&settings.paths.output_root), &session, &test_settings)?;
    let sampler = telemetry::start(
        registry.clone(),
        &run_dir,
        Duration::from_secs(settings.telemetry.period_secs),
    )?;

    let (orchestrator, events) = TestOrchestrator::connect(
        registry.clone(),
        meter as Arc<dyn PowerMeter>,
        test_settings,
        pixel_map.clone(),
    )
    .await?;

    // Ctrl-C turns into an orderly abort: the run winds down through its
    // abort path and still produces a (partial) report to export.
    let mut run = std::pin::pin!(orchestrator.run());
    let report = tokio::select! {
        report = &mut run => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; aborting test");
            let _ = events.send(OrchestratorEvent::Abort);
            run.await?
        }
    };

    sampler.stop().await;
    controller.abort();

    RunExporter::new(&run_dir, &session, &report, &pixel_map).write_all()?;
    info!(
        dir = %run_dir.display(),
        passed = report.passed(),
        total = report.outcomes.len(),
        "artifacts written"
    );

    if report.aborted {
        warn!("run aborted; LUTs stay on disk and are not uploaded");
    } else if let Some(calibration) = &report.calibration {
        let pipeline = UploadPipeline::new(
            registry.clone(),
            mock_racks(settings),
            settings.machine.lut_dir.clone(),
            settings.upload.clone(),
        );
        let uploaded = pipeline.upload_calibration(calibration).await?;
        info!(uploaded, "calibration LUTs uploaded");
    }

    registry.unsubscribe_all().await?;
    pump.abort();
    Ok(())
}

async fn upload_linear(settings: &Settings) -> Result<()> {
    let pixel_map = PixelMap::sequential(
        settings.machine.num_pixels,
        settings.machine.lasers_per_rack,
    );
    let (plc, _changes) = MockPlc::new();
    sim::seed_idle_controller(&plc, "DP1", "VulcanOne");
    let registry = Arc::new(TagRegistry::new(
        plc,
        Duration::from_millis(settings.plc.sampling_interval_ms),
    ));
    let pipeline = UploadPipeline::new(
        registry,
        mock_racks(settings),
        settings.machine.lut_dir.clone(),
        settings.upload.clone(),
    );
    let uploaded = pipeline.upload_linear(&pixel_map).await?;
    info!(uploaded, "linear LUTs uploaded");
    Ok(())
}
