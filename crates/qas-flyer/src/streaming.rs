//! APB analog pizza-box in streaming mode.
//!
//! The streaming box digitises eight analog inputs at a fixed rate and writes
//! them to a `.bin` file with a `.txt` header next to it. It is the primary
//! detector of every flyer: its `streaming` readback tells the flyer when
//! acquisition is actually running.
//!
//! Unlike pizza-box channels, staging needs the trajectory duration to size
//! the acquisition, so it is [`ApbStream::stage_for`] rather than
//! `Stageable::stage`.

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use qas_core::capabilities::Flyable;
use qas_core::config::Settings;
use qas_core::document::{
    describe_single, new_uid, now_secs, AssetDoc, AssetQueue, CollectPoint, DataKey, Datum,
    DescribeCollect, Kwargs, Resource,
};
use qas_core::paths::{DatedPath, PathStrategy};
use qas_core::signal::{get_f64, Edge, SignalMonitor, SignalRef};
use qas_core::status::{Status, SubscriptionStatus};
use qas_core::{AppResult, CancellationToken, FlyerError};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::state::{check_transition, AcqEvent, AcqState};

/// Resource spec of streaming box files.
pub const APB_RESOURCE_SPEC: &str = "APB";

/// Samples to acquire for a trajectory of `duration` seconds.
///
/// One extra second covers motor acceleration; the margin and rounding keep
/// the box streaming until the motion has certainly ended. Ties round to the
/// even multiple of `quantum`.
pub fn expected_points(rate_hz: f64, duration: f64, margin: f64, quantum: u64) -> u64 {
    let quantum = quantum.max(1) as f64;
    let raw = rate_hz * (duration + 1.0) * margin;
    ((raw / quantum).round_ties_even() * quantum).max(0.0) as u64
}

/// Registers of the streaming box.
#[derive(Clone)]
pub struct ApbSignals {
    /// Stream enable, 1 = start
    pub stream: SignalRef,
    /// Streaming readback
    pub streaming: SignalRef,
    /// Acquisition rate in kHz
    pub acq_rate: SignalRef,
    /// Samples to stream before stopping
    pub stream_samples: SignalRef,
    /// Trigger source selection
    pub trig_source: SignalRef,
    /// Binary file name
    pub filename_bin: SignalRef,
    /// Header file name
    pub filename_txt: SignalRef,
    /// Binary file saved, 1 = done
    pub filebin_status: SignalRef,
    /// Header file saved, 1 = done
    pub filetxt_status: SignalRef,
}

/// Sizing and mount-check parameters.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Safety factor on the expected sample count
    pub sample_margin: f64,
    /// Sample counts are rounded to a multiple of this
    pub rounding_quantum: u64,
    /// Samples acquired by the mount check
    pub mount_check_samples: u64,
    /// Bound on the mount check
    pub mount_check_wait: Duration,
    /// Directory probed by the mount check
    pub mount_root: PathBuf,
}

impl StreamConfig {
    /// Configuration from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            sample_margin: settings.streaming.sample_margin,
            rounding_quantum: settings.streaming.rounding_quantum,
            mount_check_samples: settings.streaming.mount_check_samples,
            mount_check_wait: settings.streaming.mount_check_wait,
            mount_root: settings.paths.mount_root.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct StreamInner {
    state: AcqState,
    resource: Option<Resource>,
    filename_bin: String,
    filename_txt: String,
    num_points: u64,
    counter: u64,
    datums: Vec<Datum>,
    scan: Option<CancellationToken>,
}

/// Streaming detector.
pub struct ApbStream {
    name: String,
    signals: ApbSignals,
    paths: DatedPath,
    config: StreamConfig,
    cancel_root: CancellationToken,
    inner: Mutex<StreamInner>,
    assets: AssetQueue,
}

impl ApbStream {
    /// New detector. Pending statuses fail when `cancel_root` fires.
    pub fn new(
        name: impl Into<String>,
        signals: ApbSignals,
        paths: DatedPath,
        config: StreamConfig,
        cancel_root: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            signals,
            paths,
            config,
            cancel_root,
            inner: Mutex::new(StreamInner::default()),
            assets: AssetQueue::new(),
        }
    }

    /// Current acquisition state.
    pub async fn state(&self) -> AcqState {
        self.inner.lock().await.state
    }

    /// Samples requested by the last `stage_for`.
    pub async fn num_points(&self) -> u64 {
        self.inner.lock().await.num_points
    }

    /// Subscribe to the streaming readback.
    pub fn streaming_monitor(&self) -> SignalMonitor {
        self.signals.streaming.monitor()
    }

    /// Acquisition rate in Hz.
    pub async fn rate_hz(&self) -> AppResult<f64> {
        let khz = get_f64(self.signals.acq_rate.as_ref()).await?;
        if !(khz.is_finite() && khz > 0.0) {
            return Err(FlyerError::Configuration(format!(
                "{}: acquisition rate {khz} kHz is not positive",
                self.name
            )));
        }
        Ok(khz * 1000.0)
    }

    /// Prepare an acquisition covering a trajectory of `duration` seconds.
    ///
    /// Returns the number of samples requested from the box.
    pub async fn stage_for(&self, duration: f64) -> AppResult<u64> {
        let mut inner = self.inner.lock().await;
        let next = check_transition(&self.name, inner.state, AcqEvent::Stage)?;

        let rate = self.rate_hz().await?;
        let num_points = expected_points(
            rate,
            duration,
            self.config.sample_margin,
            self.config.rounding_quantum,
        );
        self.signals.stream_samples.put(num_points.into()).await?;

        let path = self.paths.checked_path(&self.name, &new_uid(), Utc::now())?;
        let filename_bin = format!("{}.bin", path.full);
        let filename_txt = format!("{}.txt", path.full);
        self.signals.filename_bin.put(filename_bin.clone().into()).await?;
        self.signals.filename_txt.put(filename_txt.clone().into()).await?;

        let resource = Resource::new(
            APB_RESOURCE_SPEC,
            path.root.clone(),
            format!("{}.bin", path.relative()),
            Kwargs::new(),
        );
        self.signals.trig_source.put(1.into()).await?;
        self.assets.push(AssetDoc::Resource(resource.clone()));

        inner.resource = Some(resource);
        inner.filename_bin = filename_bin;
        inner.filename_txt = filename_txt;
        inner.num_points = num_points;
        inner.counter = 0;
        inner.datums.clear();
        inner.scan = Some(self.cancel_root.child_token());
        inner.state = next;
        info!(device = %self.name, rate_hz = rate, duration, num_points, "Staged");
        Ok(num_points)
    }

    /// Prove that the box can write to its storage.
    ///
    /// Runs a short acquisition into `<mount_root>/<year>/test.{bin,txt}` and
    /// waits, bounded, for both files to be reported as saved.
    pub async fn check_mount(&self) -> AppResult<()> {
        let dir = self
            .config
            .mount_root
            .join(format!("{:04}", Utc::now().year()));
        let token = self.cancel_root.child_token();
        let wait = Some(self.config.mount_check_wait);
        let bin = SubscriptionStatus::new(
            format!("{}_mount_bin", self.name),
            self.signals.filebin_status.monitor(),
        )
        .cancel_on(&token)
        .timeout(wait)
        .edge(Edge::Rising);
        let txt = SubscriptionStatus::new(
            format!("{}_mount_txt", self.name),
            self.signals.filetxt_status.monitor(),
        )
        .cancel_on(&token)
        .timeout(wait)
        .edge(Edge::Rising);

        let bin_path = dir.join("test.bin").to_string_lossy().into_owned();
        let txt_path = dir.join("test.txt").to_string_lossy().into_owned();
        self.signals.filename_bin.put(bin_path.into()).await?;
        self.signals.filename_txt.put(txt_path.into()).await?;
        self.signals
            .stream_samples
            .put(self.config.mount_check_samples.into())
            .await?;
        self.signals.stream.put(1.into()).await?;

        let outcome = bin.and(&txt).wait().await;
        token.cancel();
        match outcome {
            Ok(()) => {
                info!(device = %self.name, mount_root = %self.config.mount_root.display(), "Storage mounted");
                Ok(())
            }
            Err(err) => {
                error!(
                    device = %self.name,
                    mount_root = %self.config.mount_root.display(),
                    error = %err,
                    invariant = "streaming storage mounted before fly scan",
                    "Mount check failed"
                );
                self.signals.stream.put(0.into()).await?;
                Err(FlyerError::MountNotAvailable {
                    mount_root: self.config.mount_root.display().to_string(),
                })
            }
        }
    }

    /// Release the detector; pending file statuses fail as cancelled.
    pub async fn unstage(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(scan) = inner.scan.take() {
            scan.cancel();
        }
        let armed = inner.state == AcqState::Armed;
        inner.resource = None;
        inner.state = AcqState::Idle;
        if armed {
            self.signals.stream.put(0.into()).await?;
        }
        debug!(device = %self.name, "Unstaged");
        Ok(())
    }
}

#[async_trait]
impl Flyable for ApbStream {
    fn name(&self) -> &str {
        &self.name
    }

    /// Start streaming.
    async fn kickoff(&self) -> AppResult<Status> {
        let mut inner = self.inner.lock().await;
        let next = check_transition(&self.name, inner.state, AcqEvent::Kickoff)?;
        self.signals.stream.put(1.into()).await?;
        inner.state = next;
        debug!(device = %self.name, "Streaming armed");
        Ok(Status::done(format!("{}_kickoff", self.name)))
    }

    /// Stop streaming; resolves once both files are saved.
    async fn complete(&self) -> AppResult<Status> {
        let mut inner = self.inner.lock().await;
        let next = check_transition(&self.name, inner.state, AcqEvent::Complete)?;
        let scan = inner.scan.clone().unwrap_or_else(|| self.cancel_root.child_token());

        let bin = SubscriptionStatus::new(
            format!("{}_filebin", self.name),
            self.signals.filebin_status.monitor(),
        )
        .cancel_on(&scan)
        .edge(Edge::Rising);
        let txt = SubscriptionStatus::new(
            format!("{}_filetxt", self.name),
            self.signals.filetxt_status.monitor(),
        )
        .cancel_on(&scan)
        .edge(Edge::Rising);
        self.signals.stream.put(0.into()).await?;

        let resource = inner.resource.clone().ok_or_else(|| {
            FlyerError::sequence(&self.name, "complete", "staged without a resource")
        })?;
        let datum = Datum::numbered(&resource, inner.counter, Kwargs::new());
        inner.counter += 1;
        self.assets.push(AssetDoc::Datum(datum.clone()));
        inner.datums.push(datum);
        inner.state = next;
        Ok(bin.and(&txt))
    }

    async fn describe_collect(&self) -> DescribeCollect {
        let inner = self.inner.lock().await;
        let key = DataKey::external_array(APB_RESOURCE_SPEC, vec![-1, -1])
            .with_extra("filename_bin", inner.filename_bin.clone())
            .with_extra("filename_txt", inner.filename_txt.clone());
        describe_single(&self.name, key)
    }

    async fn collect(&self) -> AppResult<Vec<CollectPoint>> {
        let datums = std::mem::take(&mut self.inner.lock().await.datums);
        let now = now_secs();
        Ok(datums
            .iter()
            .map(|d| CollectPoint::reference(&self.name, &d.datum_id, now))
            .collect())
    }

    async fn collect_asset_docs(&self) -> Vec<AssetDoc> {
        self.assets.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qas_core::signal::{LocalSignal, PvValue, Signal};
    use qas_core::StatusError;
    use std::sync::Arc;
    use tracing_test::traced_test;

    struct Rig {
        stream: Arc<LocalSignal>,
        streaming: Arc<LocalSignal>,
        stream_samples: Arc<LocalSignal>,
        filename_bin: Arc<LocalSignal>,
        filebin: Arc<LocalSignal>,
        filetxt: Arc<LocalSignal>,
        trig_source: Arc<LocalSignal>,
        apb: ApbStream,
    }

    fn rig(mount_wait: Duration) -> Rig {
        let sig = |name: &str, v: PvValue| Arc::new(LocalSignal::new(format!("XF:07BMB-CT{{PBA:1}}:{name}"), v));
        let stream = sig("Stream", 0.into());
        let streaming = sig("Streaming-I", 0.into());
        let stream_samples = sig("StreamSamples", 0.into());
        let filename_bin = sig("FilenameBin", "".into());
        let filebin = sig("FileBinStatus", 0.into());
        let filetxt = sig("FileTxtStatus", 0.into());
        let trig_source = sig("TrigSource", 0.into());
        let signals = ApbSignals {
            stream: stream.clone(),
            streaming: streaming.clone(),
            acq_rate: sig("FA:Rate-I", 1.0.into()),
            stream_samples: stream_samples.clone(),
            trig_source: trig_source.clone(),
            filename_bin: filename_bin.clone(),
            filename_txt: sig("FilenameTxt", "".into()),
            filebin_status: filebin.clone(),
            filetxt_status: filetxt.clone(),
        };
        let config = StreamConfig {
            mount_check_wait: mount_wait,
            ..StreamConfig::from_settings(&Settings::default())
        };
        let apb = ApbStream::new(
            "apb_ave",
            signals,
            DatedPath::new("/nsls2/data/qas-new/legacy", "raw", "apb"),
            config,
            CancellationToken::new(),
        );
        Rig {
            stream,
            streaming,
            stream_samples,
            filename_bin,
            filebin,
            filetxt,
            trig_source,
            apb,
        }
    }

    #[test]
    fn ten_second_trajectory_at_one_kilohertz_requests_14300_points() {
        assert_eq!(expected_points(1000.0, 10.0, 1.3, 100), 14300);
        assert_eq!(expected_points(2000.0, 0.0, 1.3, 100), 2600);
    }

    #[test]
    fn expected_points_round_half_to_even() {
        assert_eq!(expected_points(250.0, 0.0, 1.0, 100), 200);
        assert_eq!(expected_points(350.0, 0.0, 1.0, 100), 400);
        assert_eq!(expected_points(150.0, 10.0, 1.0, 100), 1600);
    }

    #[tokio::test]
    async fn failed_stage_queues_no_resource() {
        let rig = rig(Duration::from_secs(1));
        rig.trig_source.set_connected(false);
        assert!(matches!(
            rig.apb.stage_for(10.0).await,
            Err(FlyerError::NotConnected { .. })
        ));
        assert_eq!(rig.apb.state().await, AcqState::Idle);
        assert!(rig.apb.collect_asset_docs().await.is_empty());

        rig.trig_source.set_connected(true);
        rig.apb.stage_for(10.0).await.unwrap();
        assert_eq!(rig.apb.collect_asset_docs().await.len(), 1);
    }

    #[tokio::test]
    async fn stage_sizes_and_names_the_acquisition() {
        let rig = rig(Duration::from_secs(1));
        let points = rig.apb.stage_for(10.0).await.unwrap();
        assert_eq!(points, 14300);
        assert_eq!(rig.stream_samples.value(), PvValue::Int(14300));
        let bin = rig.filename_bin.value().as_text();
        assert!(bin.starts_with("/nsls2/data/qas-new/legacy/raw/apb/"));
        assert!(bin.ends_with(".bin"));

        let docs = rig.apb.collect_asset_docs().await;
        let AssetDoc::Resource(resource) = &docs[0] else {
            panic!("expected resource")
        };
        assert_eq!(resource.spec, "APB");
        assert!(resource.resource_path.starts_with("raw/apb/"));
        assert!(rig.apb.stage_for(10.0).await.is_err());
    }

    #[tokio::test]
    async fn complete_waits_for_both_files() {
        let rig = rig(Duration::from_secs(1));
        assert!(matches!(
            rig.apb.complete().await,
            Err(FlyerError::Sequence { .. })
        ));
        rig.apb.stage_for(1.0).await.unwrap();
        rig.apb.kickoff().await.unwrap();
        assert_eq!(rig.stream.value(), PvValue::Int(1));
        rig.streaming.set(1);

        let status = rig.apb.complete().await.unwrap();
        assert_eq!(rig.stream.value(), PvValue::Int(0));
        rig.filebin.set(1);
        tokio::task::yield_now().await;
        assert!(!status.is_done());
        rig.filetxt.set(1);
        assert_eq!(status.wait().await, Ok(()));

        assert_eq!(rig.apb.collect().await.unwrap().len(), 1);
        assert!(rig.apb.collect().await.unwrap().is_empty());
        let describe = rig.apb.describe_collect().await;
        assert_eq!(describe["apb_ave"]["apb_ave"].shape, vec![-1, -1]);
    }

    #[tokio::test]
    async fn unstage_fails_pending_file_status() {
        let rig = rig(Duration::from_secs(1));
        rig.apb.stage_for(1.0).await.unwrap();
        rig.apb.kickoff().await.unwrap();
        let status = rig.apb.complete().await.unwrap();
        rig.apb.unstage().await.unwrap();
        assert_eq!(status.wait().await, Err(StatusError::Cancelled));
        assert_eq!(rig.apb.state().await, AcqState::Idle);
    }

    #[tokio::test]
    async fn unstage_while_armed_stops_streaming() {
        let rig = rig(Duration::from_secs(1));
        rig.apb.stage_for(1.0).await.unwrap();
        rig.apb.kickoff().await.unwrap();
        rig.apb.unstage().await.unwrap();
        assert_eq!(rig.stream.value(), PvValue::Int(0));
    }

    #[tokio::test]
    async fn unstage_returns_to_idle_when_stream_is_unreachable() {
        let rig = rig(Duration::from_secs(1));
        rig.apb.stage_for(1.0).await.unwrap();
        rig.apb.kickoff().await.unwrap();
        rig.stream.set_connected(false);

        assert!(rig.apb.unstage().await.is_err());
        assert_eq!(rig.apb.state().await, AcqState::Idle);

        rig.stream.set_connected(true);
        rig.apb.stage_for(1.0).await.unwrap();
    }

    #[tokio::test]
    async fn mount_check_passes_when_files_are_saved() {
        let rig = rig(Duration::from_secs(5));
        let mut stream = rig.stream.monitor();
        let filebin = rig.filebin.clone();
        let filetxt = rig.filetxt.clone();
        tokio::spawn(async move {
            while let Some(change) = stream.next().await {
                if change.new == PvValue::Int(1) {
                    filebin.set(1);
                    filetxt.set(1);
                }
            }
        });
        rig.apb.check_mount().await.unwrap();
        assert_eq!(rig.stream_samples.value(), PvValue::Int(2000));
        assert!(rig.filename_bin.value().as_text().ends_with("test.bin"));
    }

    #[tokio::test]
    #[traced_test]
    async fn mount_check_times_out_and_stops_streaming() {
        let rig = rig(Duration::from_millis(30));
        let err = rig.apb.check_mount().await.unwrap_err();
        assert!(matches!(err, FlyerError::MountNotAvailable { .. }));
        assert_eq!(rig.stream.value(), PvValue::Int(0));
        assert!(logs_contain("Mount check failed"));
    }
}
