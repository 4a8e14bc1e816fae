//! LUT upload to the rack controllers.
//!
//! Each rack controller exposes a small file service. Before any upload the
//! pipeline polls every rack's LUT directory until the controller has
//! cleared it, bounded by a timeout; on timeout the upload is abandoned
//! without signaling completion, so the controller never loads a partial
//! set. Individual file writes get a bounded retry.

use crate::calib::{encode_blob, linear_lut, CalibrationSet};
use crate::config::UploadSettings;
use crate::error::{CalError, CalResult};
use crate::pixel::PixelMap;
use crate::tags::{TagId, TagRegistry, TagValue};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

/// Default identity-LUT calibration generation.
pub const LINEAR_CAL_ID: u32 = 99_999;

const CLEAR_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Filename the rack firmware expects for one pixel's LUT.
pub fn lut_filename(rack: u8, laser: u8, cal_id: u32) -> String {
    format!("VF-LaserPowerLUT_R{rack:02}_P{laser:02}_ID{cal_id:05}.vflpc")
}

/// File service exposed by one rack controller.
#[async_trait]
pub trait RackEndpoint: Send + Sync {
    /// 1-based rack index this endpoint serves.
    fn rack(&self) -> u8;

    /// List filenames in a directory.
    async fn list(&self, dir: &str) -> CalResult<Vec<String>>;

    /// Write one file.
    async fn put(&self, dir: &str, filename: &str, bytes: &[u8]) -> CalResult<()>;

    /// Read one file.
    async fn fetch(&self, dir: &str, filename: &str) -> CalResult<Vec<u8>>;
}

#[derive(Default)]
struct MockRackState {
    /// dir -> filename -> bytes
    files: HashMap<String, HashMap<String, Vec<u8>>>,
    /// Remaining `put` calls that fail before one succeeds.
    put_failures: u32,
    /// When set, `list` keeps reporting this many phantom files.
    stuck_files: usize,
}

/// In-memory rack controller for tests and simulation mode.
pub struct MockRack {
    rack: u8,
    state: Mutex<MockRackState>,
}

impl MockRack {
    pub fn new(rack: u8) -> Arc<Self> {
        Arc::new(Self {
            rack,
            state: Mutex::new(MockRackState::default()),
        })
    }

    pub fn seed_file(&self, dir: &str, filename: &str, bytes: Vec<u8>) {
        self.state
            .lock()
            .files
            .entry(dir.to_string())
            .or_default()
            .insert(filename.to_string(), bytes);
    }

    /// Make the next `count` put calls fail.
    pub fn fail_puts(&self, count: u32) {
        self.state.lock().put_failures = count;
    }

    /// Pretend the controller never clears its LUT directory.
    pub fn stick_directory(&self, files: usize) {
        self.state.lock().stuck_files = files;
    }

    pub fn file(&self, dir: &str, filename: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .files
            .get(dir)
            .and_then(|d| d.get(filename))
            .cloned()
    }

    pub fn file_count(&self, dir: &str) -> usize {
        self.state
            .lock()
            .files
            .get(dir)
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl RackEndpoint for MockRack {
    fn rack(&self) -> u8 {
        self.rack
    }

    async fn list(&self, dir: &str) -> CalResult<Vec<String>> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .files
            .get(dir)
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        for i in 0..state.stuck_files {
            names.push(format!("stale_{i}.vflpc"));
        }
        Ok(names)
    }

    async fn put(&self, dir: &str, filename: &str, bytes: &[u8]) -> CalResult<()> {
        let mut state = self.state.lock();
        if state.put_failures > 0 {
            state.put_failures -= 1;
            return Err(CalError::Transfer(format!(
                "rack {} refused {filename}",
                self.rack
            )));
        }
        state
            .files
            .entry(dir.to_string())
            .or_default()
            .insert(filename.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn fetch(&self, dir: &str, filename: &str) -> CalResult<Vec<u8>> {
        self.state
            .lock()
            .files
            .get(dir)
            .and_then(|d| d.get(filename))
            .cloned()
            .ok_or_else(|| {
                CalError::Transfer(format!("rack {}: no such file {dir}/{filename}", self.rack))
            })
    }
}

/// Pushes encoded LUT blobs to their owning racks.
///
/// The controller brackets every push: asserting `DeleteLUTs` tells it to
/// clear the active tables (which empties the rack LUT directories the
/// clearance poll watches), and `UploadLUTs` tells it to load the new set.
/// The latter is asserted only after every file landed, so a failed upload
/// never gets loaded.
pub struct UploadPipeline {
    registry: Arc<TagRegistry>,
    racks: Vec<Arc<dyn RackEndpoint>>,
    lut_dir: String,
    settings: UploadSettings,
}

impl UploadPipeline {
    pub fn new(
        registry: Arc<TagRegistry>,
        racks: Vec<Arc<dyn RackEndpoint>>,
        lut_dir: impl Into<String>,
        settings: UploadSettings,
    ) -> Self {
        Self {
            registry,
            racks,
            lut_dir: lut_dir.into(),
            settings,
        }
    }

    fn endpoint(&self, rack: u8) -> CalResult<&Arc<dyn RackEndpoint>> {
        self.racks
            .iter()
            .find(|r| r.rack() == rack)
            .ok_or_else(|| CalError::Transfer(format!("no endpoint for rack {rack}")))
    }

    /// Poll every rack's LUT directory until the controller has emptied it.
    ///
    /// Fail-closed: a timeout aborts the whole upload and nothing signals
    /// completion to the controller.
    pub async fn wait_until_cleared(&self) -> CalResult<()> {
        let wait = Duration::from_secs(self.settings.clear_timeout_secs);
        let deadline = Instant::now() + wait;
        for rack in &self.racks {
            loop {
                let remaining = rack.list(&self.lut_dir).await?;
                if remaining.is_empty() {
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(CalError::Transfer(format!(
                        "rack {} still holds {} LUT file(s) after {}s",
                        rack.rack(),
                        remaining.len(),
                        wait.as_secs()
                    )));
                }
                tokio::time::sleep(CLEAR_POLL_INTERVAL).await;
            }
        }
        Ok(())
    }

    async fn put_with_retry(
        &self,
        rack: &Arc<dyn RackEndpoint>,
        filename: &str,
        bytes: &[u8],
    ) -> CalResult<()> {
        let mut attempt = 0;
        loop {
            match rack.put(&self.lut_dir, filename, bytes).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.settings.retry_limit => {
                    attempt += 1;
                    warn!(%err, filename, attempt, "upload retry");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Tell the controller to drop the active tables, then wait for the
    /// rack directories to empty out.
    async fn request_clearance(&self) -> CalResult<()> {
        self.registry
            .write(TagId::DeleteLuts, TagValue::Bool(true))
            .await?;
        self.wait_until_cleared().await
    }

    /// Tell the controller the new set is in place.
    async fn signal_loaded(&self) -> CalResult<()> {
        self.registry
            .write(TagId::UploadLuts, TagValue::Bool(true))
            .await
    }

    /// Upload a full calibration set: request clearance, write every
    /// pixel's blob to its owning rack, then signal the controller to load.
    pub async fn upload_calibration(&self, set: &CalibrationSet) -> CalResult<usize> {
        self.request_clearance().await?;
        let mut uploaded = 0;
        for cal in &set.pixels {
            let rack = self.endpoint(cal.rack)?;
            let filename = lut_filename(cal.rack, cal.laser, set.cal_id);
            self.put_with_retry(rack, &filename, &cal.blob).await?;
            uploaded += 1;
        }
        self.signal_loaded().await?;
        info!(uploaded, "calibration LUTs uploaded");
        Ok(uploaded)
    }

    /// Push identity LUTs for every mapped pixel, the safe baseline that a
    /// calibration run fires against.
    pub async fn upload_linear(&self, pixel_map: &PixelMap) -> CalResult<usize> {
        self.request_clearance().await?;
        let blob = encode_blob(&linear_lut());
        let mut uploaded = 0;
        for channel in pixel_map.channels() {
            let rack = self.endpoint(channel.rack)?;
            let filename = lut_filename(channel.rack, channel.laser, LINEAR_CAL_ID);
            self.put_with_retry(rack, &filename, &blob).await?;
            uploaded += 1;
        }
        self.signal_loaded().await?;
        info!(uploaded, "linear LUTs uploaded");
        Ok(uploaded)
    }

    /// Download and parse the pixel map from rack 1.
    pub async fn fetch_pixel_map(&self, dir: &str, filename: &str) -> CalResult<PixelMap> {
        let rack = self.endpoint(1)?;
        let fetch = rack.fetch(dir, filename);
        let bytes = timeout(Duration::from_secs(self.settings.clear_timeout_secs), fetch)
            .await
            .map_err(|_| CalError::Transfer("pixel map download timed out".into()))??;
        let text = String::from_utf8(bytes)
            .map_err(|_| CalError::Transfer("pixel map is not valid UTF-8".into()))?;
        PixelMap::parse_vfpmap(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calib::{CalibrationEngine, CalibrationSet};
    use crate::instrument::MeterSample;
    use crate::orchestrator::samples::RawSampleSet;
    use crate::orchestrator::settings::{TestSettings, TestType};
    use crate::orchestrator::status::PixelStatus;
    use crate::tags::MockPlc;

    fn pipeline(
        racks: Vec<Arc<MockRack>>,
        clear_timeout_secs: u64,
    ) -> (UploadPipeline, Vec<Arc<MockRack>>, Arc<MockPlc>) {
        let (plc, _changes) = MockPlc::new();
        let registry = Arc::new(TagRegistry::new(
            plc.clone(),
            Duration::from_millis(10),
        ));
        let endpoints: Vec<Arc<dyn RackEndpoint>> = racks
            .iter()
            .map(|r| r.clone() as Arc<dyn RackEndpoint>)
            .collect();
        (
            UploadPipeline::new(
                registry,
                endpoints,
                "/MachineParameters",
                UploadSettings {
                    clear_timeout_secs,
                    retry_limit: 1,
                },
            ),
            racks,
            plc,
        )
    }

    fn small_calibration() -> CalibrationSet {
        let mut settings = TestSettings::defaults(TestType::Calibration);
        settings.pixel_list = vec![1, 22];
        let map = PixelMap::sequential(84, 21);
        let engine = CalibrationEngine::new(&settings, &map);
        let pulse_on = settings.pulse_on_secs();
        let captured: Vec<(RawSampleSet, PixelStatus)> = [1u32, 22]
            .iter()
            .map(|&pixel| {
                let mut set = RawSampleSet::new(pixel);
                for watts in settings.commanded_levels_watts() {
                    set.ingest(watts, &[MeterSample::clean(watts * pulse_on, 0.0)]);
                }
                (set, PixelStatus::Passed)
            })
            .collect();
        engine.calibrate(&captured).unwrap()
    }

    #[test]
    fn filenames_follow_the_firmware_convention() {
        assert_eq!(
            lut_filename(2, 1, 42),
            "VF-LaserPowerLUT_R02_P01_ID00042.vflpc"
        );
        assert_eq!(
            lut_filename(4, 21, LINEAR_CAL_ID),
            "VF-LaserPowerLUT_R04_P21_ID99999.vflpc"
        );
    }

    #[tokio::test]
    async fn blobs_land_on_their_owning_racks() {
        let (pipeline, racks, plc) = pipeline(vec![MockRack::new(1), MockRack::new(2)], 1);
        let set = small_calibration();
        let uploaded = pipeline.upload_calibration(&set).await.unwrap();
        assert_eq!(uploaded, 2);
        // Pixel 1 -> rack 1 laser 1, pixel 22 -> rack 2 laser 1.
        let blob = racks[0]
            .file(
                "/MachineParameters",
                &lut_filename(1, 1, set.cal_id),
            )
            .unwrap();
        assert_eq!(blob.len(), 516);
        assert_eq!(racks[1].file_count("/MachineParameters"), 1);
        // The controller was told to clear first and to load last.
        assert_eq!(
            plc.node_value(TagId::DeleteLuts.node_path()),
            Some(TagValue::Bool(true))
        );
        assert_eq!(
            plc.node_value(TagId::UploadLuts.node_path()),
            Some(TagValue::Bool(true))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn uncleared_rack_fails_closed() {
        let (pipeline, racks, plc) = pipeline(vec![MockRack::new(1)], 1);
        racks[0].stick_directory(3);
        let err = pipeline
            .upload_calibration(&small_calibration())
            .await
            .unwrap_err();
        assert!(matches!(err, CalError::Transfer(_)));
        assert_eq!(racks[0].file_count("/MachineParameters"), 0);
        // Fail-closed: the controller is never told to load.
        assert_eq!(plc.node_value(TagId::UploadLuts.node_path()), None);
    }

    #[tokio::test]
    async fn one_transient_put_failure_is_retried() {
        let (pipeline, racks, _plc) = pipeline(vec![MockRack::new(1)], 1);
        racks[0].fail_puts(1);
        let map = PixelMap::sequential(2, 21);
        assert_eq!(pipeline.upload_linear(&map).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn persistent_put_failure_gives_up() {
        let (pipeline, racks, plc) = pipeline(vec![MockRack::new(1)], 1);
        racks[0].fail_puts(10);
        let map = PixelMap::sequential(1, 21);
        assert!(matches!(
            pipeline.upload_linear(&map).await,
            Err(CalError::Transfer(_))
        ));
        assert_eq!(plc.node_value(TagId::UploadLuts.node_path()), None);
    }

    #[tokio::test]
    async fn pixel_map_round_trips_through_a_rack() {
        let (pipeline, racks, _plc) = pipeline(vec![MockRack::new(1)], 1);
        racks[0].seed_file(
            "F:/PixelMapping",
            "machine.vfpmap",
            b"Pixel,Enable,Rack,Laser\n1,1,1,1\n2,1,1,2\n".to_vec(),
        );
        let map = pipeline
            .fetch_pixel_map("F:/PixelMapping", "machine.vfpmap")
            .await
            .unwrap();
        assert_eq!(map.len(), 2);
    }
}
