//! Configuration management.
//!
//! One immutable [`Settings`] value is constructed per session from layered
//! TOML (`config/default.toml` plus an optional named override) and passed
//! by `Arc` to everything that needs it. Machine identity that only the
//! controller knows (machine/factory names) lives in [`SessionInfo`],
//! resolved once at connect time.

use crate::error::{CalError, CalResult};
use crate::tags::{TagId, TagRegistry};
use config::Config;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub log_level: String,
    pub plc: PlcSettings,
    pub machine: MachineSettings,
    pub paths: PathSettings,
    pub upload: UploadSettings,
    pub telemetry: TelemetrySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlcSettings {
    pub ip_address: String,
    pub port: u16,
    /// Subscription sampling interval for live tags.
    pub sampling_interval_ms: u64,
    pub simulation: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MachineSettings {
    pub num_pixels: usize,
    pub lasers_per_rack: usize,
    /// Rack-controller addresses, rack 1 first.
    pub rack_ips: Vec<String>,
    /// Directory on each rack controller holding the active LUT files.
    pub lut_dir: String,
    /// Directory on rack 1 holding the `.vfpmap` pixel map.
    pub pixel_map_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathSettings {
    pub output_root: String,
    pub tmp_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadSettings {
    pub clear_timeout_secs: u64,
    pub retry_limit: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetrySettings {
    pub period_secs: u64,
}

impl Settings {
    pub fn new(config_name: Option<&str>) -> CalResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()
            .map_err(CalError::Config)?;
        let settings: Settings = s.try_deserialize().map_err(CalError::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks that plain deserialization cannot catch.
    pub fn validate(&self) -> CalResult<()> {
        if self.machine.num_pixels == 0 {
            return Err(CalError::Configuration("num_pixels must be > 0".into()));
        }
        if self.machine.lasers_per_rack == 0 {
            return Err(CalError::Configuration(
                "lasers_per_rack must be > 0".into(),
            ));
        }
        if self.machine.rack_ips.is_empty() {
            return Err(CalError::Configuration(
                "at least one rack controller address is required".into(),
            ));
        }
        if self.plc.sampling_interval_ms == 0 {
            return Err(CalError::Configuration(
                "sampling_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Machine identity read from the controller at session start.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub machine_id: String,
    pub factory_id: String,
}

impl SessionInfo {
    /// Resolve the identity from the `MachineName`/`FactoryName` tags.
    pub async fn from_registry(registry: &TagRegistry) -> CalResult<Self> {
        let machine_id = registry
            .read(TagId::MachineName)
            .await?
            .as_text()
            .unwrap_or_default()
            .to_string();
        let factory = registry
            .read(TagId::FactoryName)
            .await?
            .as_text()
            .unwrap_or_default()
            .to_string();
        // Historical alias used on the output share.
        let factory_id = if factory == "VulcanOne" {
            "V1".to_string()
        } else {
            factory
        };
        Ok(Self {
            machine_id,
            factory_id,
        })
    }

    /// Machine id as used in artifact paths: two-letter prefix plus a
    /// zero-padded numeric part (e.g. `DP1` -> `DP01`).
    pub fn padded_machine_id(&self) -> String {
        if self.machine_id.len() <= 2 {
            return self.machine_id.clone();
        }
        let (prefix, rest) = self.machine_id.split_at(2);
        format!("{prefix}{rest:0>2}")
    }
}
