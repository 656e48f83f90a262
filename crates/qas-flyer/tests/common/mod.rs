//! Shared fixtures for flyer integration tests.

#![allow(dead_code)]

use qas_core::capabilities::Flyable;
use qas_core::config::{MountCheckPolicy, Settings};
use qas_core::document::{AssetDoc, CollectPoint};
use qas_core::{AppResult, CancellationToken};
use qas_driver_sim::{SimBeamline, SimOptions};
use qas_flyer::Flyer;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

pub const APB: &str = "XF:07BMB-CT{PBA:1}:";
pub const STREAM: &str = "XF:07BMB-CT{PBA:1}:Stream";
pub const STREAMING: &str = "XF:07BMB-CT{PBA:1}:Streaming-I";
pub const STREAM_SAMPLES: &str = "XF:07BMB-CT{PBA:1}:FA:Stream:Samples:OUT";
pub const START_TRAJ: &str = "XF:07BMA-OP{Mono:1-Ax:Bragg}StartTraj";
pub const ENCODER_BOX: &str = "XF:07BMB-CT{Enc:1}";
pub const ENC1_GATE: &str = "XF:07BMB-CT{Enc:1}Chan0:IgnoreSel-Sel";
pub const ADC_PAIR_GATE: &str = "XF:07BMB-CT{Ana:4}Adc6-7:IgnoreSel-Sel";

/// Settings with every path under `dir` and short waits.
pub fn settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.paths.root = dir.join("legacy");
    settings.paths.pizzabox_dir = dir.join("pb");
    settings.paths.mount_root = dir.join("mnt");
    settings.trigger.stream_settle = Duration::from_millis(5);
    settings.streaming.mount_check_wait = Duration::from_millis(300);
    settings.channels.file_poll_interval = Duration::from_millis(5);
    settings.channels.file_timeout = Duration::from_secs(2);
    settings
}

/// A simulated beamline living in its own temporary directory.
pub struct Rig {
    pub sim: SimBeamline,
    pub dir: TempDir,
}

pub fn rig(options: SimOptions) -> Rig {
    rig_with(options, |_| {})
}

pub fn rig_with(options: SimOptions, tweak: impl FnOnce(&mut Settings)) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    tweak(&mut settings);
    let sim = SimBeamline::build(&settings, options, &CancellationToken::new()).unwrap();
    Rig { sim, dir }
}

pub fn no_mount_check(settings: &mut Settings) {
    settings.streaming.mount_check = MountCheckPolicy::Disabled;
}

/// Kickoff, wait, complete, wait, collect.
pub async fn fly(flyer: &Flyer) -> AppResult<(Vec<CollectPoint>, Vec<AssetDoc>)> {
    let started = flyer.kickoff().await?;
    started.wait().await?;
    let done = flyer.complete().await?;
    done.wait().await?;
    let points = flyer.collect().await?;
    let assets = flyer.collect_asset_docs().await;
    Ok((points, assets))
}

pub fn resources<'a>(assets: &'a [AssetDoc], spec: &str) -> Vec<&'a qas_core::document::Resource> {
    assets
        .iter()
        .filter_map(|doc| match doc {
            AssetDoc::Resource(r) if r.spec == spec => Some(r),
            _ => None,
        })
        .collect()
}

pub fn datums_of<'a>(
    assets: &'a [AssetDoc],
    resource_uid: &str,
) -> Vec<&'a qas_core::document::Datum> {
    assets
        .iter()
        .filter_map(|doc| match doc {
            AssetDoc::Datum(d) if d.resource == resource_uid => Some(d),
            _ => None,
        })
        .collect()
}
