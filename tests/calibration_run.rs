//! End-to-end calibration sequence against the scripted controller.

use laser_cal::calib::percent_diff;
use laser_cal::config::SessionInfo;
use laser_cal::export::{create_run_dir, RunExporter};
use laser_cal::instrument::{MockPowerMeter, PowerMeter};
use laser_cal::orchestrator::settings::{TestMode, TestSettings, TestType};
use laser_cal::orchestrator::status::PixelStatus;
use laser_cal::orchestrator::{OrchestratorEvent, RunReport, TestOrchestrator};
use laser_cal::pixel::PixelMap;
use laser_cal::sim::{self, LaserResponse};
use laser_cal::tags::{MockPlc, TagId, TagRegistry, TagValue};
use laser_cal::upload::{lut_filename, MockRack, RackEndpoint, UploadPipeline};
use laser_cal::config::UploadSettings;
use std::sync::Arc;
use std::time::Duration;

async fn run_sequence(test_settings: TestSettings, response: LaserResponse) -> RunReport {
    let (plc, changes) = MockPlc::new();
    sim::seed_idle_controller(&plc, "DP1", "VulcanOne");
    let meter = Arc::new(MockPowerMeter::new());
    let controller = sim::spawn(plc.clone(), meter.clone(), response);

    let registry = Arc::new(TagRegistry::new(plc, Duration::from_millis(10)));
    let pump = tokio::spawn(registry.clone().run(changes));

    let pixel_map = PixelMap::sequential(84, 21);
    let (orchestrator, _events) = TestOrchestrator::connect(
        registry,
        meter as Arc<dyn PowerMeter>,
        test_settings,
        pixel_map,
    )
    .await
    .expect("connect");

    let report = tokio::time::timeout(Duration::from_secs(30), orchestrator.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    controller.abort();
    pump.abort();
    report
}

fn calibration_settings(pixels: Vec<u32>) -> TestSettings {
    let mut settings = TestSettings::defaults(TestType::Calibration);
    settings.pixel_list = pixels;
    // No operator at the desk; failed pixels must not hold the run.
    settings.test_mode = TestMode::Continuous;
    settings
}

#[tokio::test]
async fn ideal_lasers_pass_and_fit_the_identity_curve() {
    let report = run_sequence(calibration_settings(vec![1, 2, 22]), LaserResponse::Ideal).await;

    assert!(!report.aborted);
    assert_eq!(report.outcomes.len(), 3);
    assert!(report
        .outcomes
        .iter()
        .all(|o| o.status == PixelStatus::Passed));

    let calibration = report.calibration.as_ref().expect("calibration set");
    assert_eq!(calibration.pixels.len(), 3);
    for cal in &calibration.pixels {
        assert!(cal.coefficients.a.abs() < 1e-6, "a = {}", cal.coefficients.a);
        assert!(
            (cal.coefficients.b - 1.0).abs() < 1e-6,
            "b = {}",
            cal.coefficients.b
        );
        assert!(cal.coefficients.c.abs() < 1e-6, "c = {}", cal.coefficients.c);
        assert_eq!(cal.blob.len(), 516);
    }
    // Pixel 22 belongs to the second rack, first laser.
    let p22 = calibration.pixels.iter().find(|c| c.pixel == 22).unwrap();
    assert_eq!((p22.rack, p22.laser), (2, 1));
}

#[tokio::test]
async fn weak_lasers_within_tolerance_get_a_tracking_fit() {
    // 70 % output sits inside the default 50 % band, so the pixel passes
    // and the fitted slope follows the response.
    let report = run_sequence(calibration_settings(vec![1]), LaserResponse::Scaled(0.7)).await;

    assert_eq!(report.outcomes[0].status, PixelStatus::Passed);
    let cal = &report.calibration.as_ref().unwrap().pixels[0];
    assert!((cal.coefficients.b - 0.7).abs() < 1e-6);
}

#[tokio::test]
async fn weak_lasers_outside_tolerance_fail_and_keep_the_identity_line() {
    let mut settings = calibration_settings(vec![1]);
    settings.tolerance_percent = 20.0;
    let report = run_sequence(settings, LaserResponse::Scaled(0.7)).await;

    assert_eq!(report.outcomes[0].status, PixelStatus::LowPowerFailure);
    let cal = &report.calibration.as_ref().unwrap().pixels[0];
    assert_eq!(cal.coefficients.b, 1.0);
    assert_eq!(cal.coefficients.a, 0.0);
}

#[tokio::test]
async fn dead_lasers_are_no_power_failures() {
    let report = run_sequence(calibration_settings(vec![5]), LaserResponse::Dead).await;
    assert_eq!(report.outcomes[0].status, PixelStatus::NoPowerFailure);
    // A dead channel must not bend its drive table.
    let cal = &report.calibration.as_ref().unwrap().pixels[0];
    assert_eq!(cal.coefficients.b, 1.0);
}

#[tokio::test]
async fn verification_runs_produce_no_calibration() {
    let mut settings = TestSettings::defaults(TestType::CleanPowerVerification);
    settings.pixel_list = vec![1, 2];
    let report = run_sequence(settings, LaserResponse::Ideal).await;
    assert!(report.calibration.is_none());
    assert_eq!(report.passed(), 2);
}

#[tokio::test]
async fn artifacts_and_uploads_round_trip() {
    let report = run_sequence(calibration_settings(vec![1, 22]), LaserResponse::Ideal).await;
    let session = SessionInfo {
        machine_id: "DP1".into(),
        factory_id: "V1".into(),
    };
    let pixel_map = PixelMap::sequential(84, 21);

    // Exports.
    let tmp = tempfile::tempdir().unwrap();
    let run_dir = create_run_dir(tmp.path(), &session, &report.settings).unwrap();
    RunExporter::new(&run_dir, &session, &report, &pixel_map)
        .write_all()
        .unwrap();
    for artifact in [
        "LPM_Raw.csv",
        "LPM_processed.csv",
        "LUT_Coeff.csv",
        "LUT_Raw.csv",
        "summary.csv",
        "log.csv",
    ] {
        assert!(run_dir.join(artifact).exists(), "{artifact} missing");
    }
    let summary = std::fs::read_to_string(run_dir.join("summary.csv")).unwrap();
    assert!(summary.contains("1;22"));

    // Upload.
    let racks: Vec<Arc<MockRack>> = (1..=4).map(MockRack::new).collect();
    let endpoints: Vec<Arc<dyn RackEndpoint>> = racks
        .iter()
        .map(|r| r.clone() as Arc<dyn RackEndpoint>)
        .collect();
    let (plc, _changes) = MockPlc::new();
    let registry = Arc::new(TagRegistry::new(plc.clone(), Duration::from_millis(10)));
    let pipeline = UploadPipeline::new(
        registry,
        endpoints,
        "/MachineParameters",
        UploadSettings {
            clear_timeout_secs: 1,
            retry_limit: 1,
        },
    );
    let calibration = report.calibration.as_ref().unwrap();
    assert_eq!(pipeline.upload_calibration(calibration).await.unwrap(), 2);

    let blob = racks[1]
        .file(
            "/MachineParameters",
            &lut_filename(2, 1, calibration.cal_id),
        )
        .expect("pixel 22 blob on rack 2");
    assert_eq!(blob.len(), 516);
    let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(&blob[..512]);
    assert_eq!(blob[512..], crc.to_le_bytes());

    // Clear-then-load signaling.
    assert_eq!(
        plc.node_value(TagId::DeleteLuts.node_path()),
        Some(TagValue::Bool(true))
    );
    assert_eq!(
        plc.node_value(TagId::UploadLuts.node_path()),
        Some(TagValue::Bool(true))
    );
}

#[tokio::test]
async fn semi_auto_holds_failed_pixels_until_the_operator_confirms() {
    let (plc, changes) = MockPlc::new();
    sim::seed_idle_controller(&plc, "DP1", "VulcanOne");
    let meter = Arc::new(MockPowerMeter::new());
    let controller = sim::spawn(plc.clone(), meter.clone(), LaserResponse::Scaled(0.2));

    let registry = Arc::new(TagRegistry::new(plc, Duration::from_millis(10)));
    let pump = tokio::spawn(registry.clone().run(changes));

    let mut settings = TestSettings::defaults(TestType::Calibration);
    settings.pixel_list = vec![1, 2];
    settings.test_mode = TestMode::SemiAuto;
    let (orchestrator, events) = TestOrchestrator::connect(
        registry,
        meter as Arc<dyn PowerMeter>,
        settings,
        PixelMap::sequential(84, 21),
    )
    .await
    .expect("connect");

    let mut runner = tokio::spawn(orchestrator.run());

    // Both pixels fail low; without confirmation the run must park after
    // the first one rather than marching on.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!runner.is_finished(), "run advanced past a failed pixel");

    events.send(OrchestratorEvent::ProceedConfirmed).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!runner.is_finished(), "run finished without confirming pixel 2");

    events.send(OrchestratorEvent::ProceedConfirmed).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(30), &mut runner)
        .await
        .expect("run timed out")
        .expect("join")
        .expect("run failed");

    assert_eq!(report.outcomes.len(), 2);
    assert!(report
        .outcomes
        .iter()
        .all(|o| o.status == PixelStatus::LowPowerFailure));
    controller.abort();
    pump.abort();
}

#[tokio::test]
async fn critical_fault_aborts_and_partial_data_still_exports() {
    let (plc, changes) = MockPlc::new();
    sim::seed_idle_controller(&plc, "DP1", "VulcanOne");
    let meter = Arc::new(MockPowerMeter::new());
    let controller = sim::spawn(plc.clone(), meter.clone(), LaserResponse::Ideal);

    let registry = Arc::new(TagRegistry::new(plc.clone(), Duration::from_millis(10)));
    let pump = tokio::spawn(registry.clone().run(changes));

    let settings = calibration_settings((1..=84).collect());
    let (orchestrator, _events) = TestOrchestrator::connect(
        registry,
        meter as Arc<dyn PowerMeter>,
        settings,
        PixelMap::sequential(84, 21),
    )
    .await
    .expect("connect");

    let runner = tokio::spawn(orchestrator.run());
    tokio::time::sleep(Duration::from_millis(200)).await;
    plc.push_change(TagId::TestStatus.node_path(), TagValue::Int(10));

    let report = tokio::time::timeout(Duration::from_secs(30), runner)
        .await
        .expect("run timed out")
        .expect("join")
        .expect("run failed");
    controller.abort();
    pump.abort();

    assert!(report.aborted);
    assert_eq!(report.outcomes.len(), 84);
    assert_eq!(
        report.outcomes.last().unwrap().status,
        PixelStatus::Aborted
    );

    // Curve generation still ran over the partial capture; pixels the run
    // never reached keep the identity line.
    let calibration = report.calibration.expect("calibration on abort");
    assert_eq!(calibration.pixels.len(), 84);
    assert_eq!(calibration.pixels.last().unwrap().coefficients.b, 1.0);

    // The controller saw the abort signal, never the completion signal.
    assert_eq!(
        plc.node_value(TagId::AbortTest.node_path()),
        Some(TagValue::Bool(true))
    );
    assert_ne!(
        plc.node_value(TagId::TestComplete.node_path()),
        Some(TagValue::Bool(true))
    );
}

#[tokio::test]
async fn measured_levels_match_the_commanded_scale() {
    let settings = calibration_settings(vec![1]);
    let expected_levels = settings.commanded_levels_watts();
    let pulse_on = settings.pulse_on_secs();
    let report = run_sequence(settings, LaserResponse::Ideal).await;

    let levels = report.outcomes[0].samples.level_mean_energies();
    assert_eq!(levels.len(), expected_levels.len());
    for (mean_energy, commanded) in levels.iter().zip(&expected_levels) {
        let measured_watts = mean_energy / pulse_on;
        assert!(percent_diff(measured_watts, *commanded) < 1e-6);
    }
    // Defaults: 24 and 29 on the 8-bit scale against 525 W available.
    assert!((expected_levels[0] - 49.411_764_705).abs() < 1e-6);
    assert!((expected_levels[1] - 59.705_882_352).abs() < 1e-6);
}
