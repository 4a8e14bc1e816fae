//! Periodic optics-box telemetry.
//!
//! While a test is running, the thermal and flow tags are sampled on a fixed
//! period and appended to `opticsBoxData.csv` in the run directory. The
//! sampler is a plain task stopped through a watch channel at run end.

use crate::error::CalResult;
use crate::tags::{TagId, TagRegistry};
use chrono::Local;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Tags sampled into the telemetry log, in column order.
pub const MONITOR_TAGS: &[TagId] = &[
    TagId::OpticsBoxFlow,
    TagId::ChillerOutputTemp,
    TagId::ChillerReturnTemp,
    TagId::OpticsBoxFiberHolderTemp,
    TagId::OpticsBoxMiMaSinkTemp,
    TagId::OpticsBoxBeamBlockATemp,
    TagId::OpticsBoxBeamBlockBTemp,
    TagId::OpticsBoxBeamBlockCTemp,
    TagId::OpticsBoxSinkUpperTemp,
    TagId::OpticsBoxSinkMiddleTemp,
    TagId::OpticsBoxSinkLowerTemp,
];

/// Handle used to stop a running sampler.
pub struct TelemetryHandle {
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl TelemetryHandle {
    /// Stop the sampler and wait for its final flush.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// Start sampling the monitor tags into `opticsBoxData.csv` under `dir`.
pub fn start(
    registry: Arc<TagRegistry>,
    dir: &Path,
    period: Duration,
) -> CalResult<TelemetryHandle> {
    let path = dir.join("opticsBoxData.csv");
    let mut writer = csv::Writer::from_path(&path)?;
    let mut header = vec!["Timestamp".to_string()];
    header.extend(MONITOR_TAGS.iter().map(ToString::to_string));
    writer.write_record(&header)?;
    writer.flush()?;

    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = sample_once(&registry, &mut writer).await {
                        warn!(%err, "telemetry sample failed");
                    }
                }
                _ = stopped.changed() => {
                    if *stopped.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(err) = writer.flush() {
            warn!(%err, "telemetry flush failed");
        }
        debug!("telemetry sampler stopped");
    });

    Ok(TelemetryHandle { stop, task })
}

async fn sample_once(
    registry: &TagRegistry,
    writer: &mut csv::Writer<std::fs::File>,
) -> CalResult<()> {
    let mut row = vec![Local::now().format("%Y-%m-%d %H:%M:%S").to_string()];
    for &tag in MONITOR_TAGS {
        let value = registry.read(tag).await?;
        row.push(value.as_f64().map_or_else(String::new, |v| v.to_string()));
    }
    writer.write_record(&row)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{MockPlc, TagValue};

    #[tokio::test(start_paused = true)]
    async fn samples_accumulate_until_stopped() {
        let (plc, _changes) = MockPlc::new();
        for &tag in MONITOR_TAGS {
            plc.seed(tag.node_path(), TagValue::Float(21.5));
        }
        let registry = Arc::new(TagRegistry::new(plc, Duration::from_millis(200)));
        let tmp = tempfile::tempdir().unwrap();

        let handle = start(registry, tmp.path(), Duration::from_secs(30)).unwrap();
        tokio::time::sleep(Duration::from_secs(95)).await;
        handle.stop().await;

        let text = std::fs::read_to_string(tmp.path().join("opticsBoxData.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // Header plus the tick at t=0 and at 30/60/90 s.
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0].split(',').count(), 1 + MONITOR_TAGS.len());
        assert!(lines[1].ends_with("21.5"));
    }
}
