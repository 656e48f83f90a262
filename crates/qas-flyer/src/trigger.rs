//! APB pulse output.
//!
//! The trigger coordinator drives the external detectors of a flyer: once
//! armed it emits `max_counts` pulses at `freq` and records every transition
//! to a binary file. `File:Status-I` reads 1 while the pulse train runs and
//! drops back to 0 when it is finished and the file is saved.

use async_trait::async_trait;
use chrono::Utc;
use qas_core::capabilities::{Flyable, Stageable};
use qas_core::config::Settings;
use qas_core::document::{
    describe_single, new_uid, now_secs, AssetDoc, AssetQueue, CollectPoint, DataKey, Datum,
    DescribeCollect, Kwargs, Resource,
};
use qas_core::paths::{DatedPath, PathStrategy};
use qas_core::signal::{get_f64, Edge, SignalMonitor, SignalRef};
use qas_core::status::{wait_for_edge, Status};
use qas_core::{AppResult, CancellationToken, FlyerError, StatusError};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::state::{check_transition, AcqEvent, AcqState};

/// Resource spec of trigger transition files.
pub const TRIGGER_RESOURCE_SPEC: &str = "APB_TRIGGER";

/// Pulse generation mode.
const ACQUIRE_GENERATE: i64 = 2;

/// Registers of the pulse output.
#[derive(Clone)]
pub struct TriggerSignals {
    /// Pulse frequency in Hz
    pub freq: SignalRef,
    /// Pulses to emit
    pub max_counts: SignalRef,
    /// Acquire mode, 2 = generate
    pub acquire: SignalRef,
    /// Stream mode
    pub stream: SignalRef,
    /// Output file name
    pub filename: SignalRef,
    /// File status, 1 while running
    pub filebin_status: SignalRef,
}

#[derive(Default)]
struct TriggerInner {
    state: AcqState,
    resource: Option<Resource>,
    filename: String,
    counter: u64,
    datums: Vec<Datum>,
    file_monitor: Option<SignalMonitor>,
    scan: Option<CancellationToken>,
}

/// Trigger coordinator.
pub struct ApbTrigger {
    name: String,
    signals: TriggerSignals,
    paths: DatedPath,
    stream_settle: Duration,
    cancel_root: CancellationToken,
    inner: Mutex<TriggerInner>,
    assets: AssetQueue,
}

impl ApbTrigger {
    /// New coordinator.
    pub fn new(
        name: impl Into<String>,
        signals: TriggerSignals,
        paths: DatedPath,
        stream_settle: Duration,
        cancel_root: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            signals,
            paths,
            stream_settle,
            cancel_root,
            inner: Mutex::new(TriggerInner::default()),
            assets: AssetQueue::new(),
        }
    }

    /// New coordinator with the settle delay from settings.
    pub fn from_settings(
        name: impl Into<String>,
        signals: TriggerSignals,
        settings: &Settings,
        cancel_root: CancellationToken,
    ) -> Self {
        Self::new(
            name,
            signals,
            DatedPath::new(&settings.paths.root, &settings.paths.raw_subdir, "apb"),
            settings.trigger.stream_settle,
            cancel_root,
        )
    }

    /// Current acquisition state.
    pub async fn state(&self) -> AcqState {
        self.inner.lock().await.state
    }

    /// Pulse frequency in Hz.
    pub async fn freq(&self) -> AppResult<f64> {
        let freq = get_f64(self.signals.freq.as_ref()).await?;
        if !(freq.is_finite() && freq > 0.0) {
            return Err(FlyerError::Configuration(format!(
                "{}: trigger frequency {freq} Hz is not positive",
                self.name
            )));
        }
        Ok(freq)
    }

    /// Size the pulse train for a trajectory of `duration` seconds.
    pub async fn prepare_to_fly(&self, duration: f64) -> AppResult<u64> {
        let freq = self.freq().await?;
        let counts = (freq * (duration + 1.0)).ceil() as u64;
        self.signals.max_counts.put(counts.into()).await?;
        debug!(device = %self.name, freq, counts, "Pulse train sized");
        Ok(counts)
    }
}

#[async_trait]
impl Stageable for ApbTrigger {
    async fn stage(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let next = check_transition(&self.name, inner.state, AcqEvent::Stage)?;
        let scan = self.cancel_root.child_token();

        let path = self.paths.checked_path(&self.name, &new_uid(), Utc::now())?;
        let filename = format!("{}.bin", path.full);
        self.signals.filename.put(filename.clone().into()).await?;
        let resource = Resource::new(
            TRIGGER_RESOURCE_SPEC,
            path.root.clone(),
            format!("{}.bin", path.relative()),
            Kwargs::new(),
        );

        self.signals.stream.put(1.into()).await?;
        // Stream mode must be latched before the generator is switched on.
        tokio::select! {
            _ = tokio::time::sleep(self.stream_settle) => {}
            _ = scan.cancelled() => return Err(StatusError::Cancelled.into()),
        }
        self.signals.acquire.put(ACQUIRE_GENERATE.into()).await?;
        self.assets.push(AssetDoc::Resource(resource.clone()));

        inner.resource = Some(resource);
        inner.filename = filename;
        inner.counter = 0;
        inner.datums.clear();
        inner.scan = Some(scan);
        inner.state = next;
        info!(device = %self.name, "Staged");
        Ok(())
    }

    async fn unstage(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(scan) = inner.scan.take() {
            scan.cancel();
        }
        inner.file_monitor = None;
        inner.resource = None;
        inner.state = AcqState::Idle;
        let acquire = self.signals.acquire.put(0.into()).await;
        let stream = self.signals.stream.put(0.into()).await;
        debug!(device = %self.name, "Unstaged");
        acquire.and(stream)
    }
}

#[async_trait]
impl Flyable for ApbTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    /// Start watching the file status so no edge is missed.
    async fn kickoff(&self) -> AppResult<Status> {
        let mut inner = self.inner.lock().await;
        let next = check_transition(&self.name, inner.state, AcqEvent::Kickoff)?;
        inner.file_monitor = Some(self.signals.filebin_status.monitor());
        inner.state = next;
        Ok(Status::done(format!("{}_kickoff", self.name)))
    }

    /// Resolves when the pulse train ends; then turns the generator off.
    async fn complete(&self) -> AppResult<Status> {
        let mut inner = self.inner.lock().await;
        let next = check_transition(&self.name, inner.state, AcqEvent::Complete)?;
        let mut monitor = inner
            .file_monitor
            .take()
            .unwrap_or_else(|| self.signals.filebin_status.monitor());
        let scan = inner.scan.clone().unwrap_or_else(|| self.cancel_root.child_token());

        let resource = inner.resource.clone().ok_or_else(|| {
            FlyerError::sequence(&self.name, "complete", "staged without a resource")
        })?;
        let datum = Datum::numbered(&resource, inner.counter, Kwargs::new());
        inner.counter += 1;
        self.assets.push(AssetDoc::Datum(datum.clone()));
        inner.datums.push(datum);
        inner.state = next;

        let acquire = self.signals.acquire.clone();
        let stream = self.signals.stream.clone();
        let device = self.name.clone();
        Ok(Status::spawn(format!("{}_complete", self.name), async move {
            wait_for_edge(&mut monitor, Edge::Falling, &scan).await?;
            acquire.put(0.into()).await?;
            stream.put(0.into()).await?;
            debug!(device = %device, "Pulse train finished");
            Ok(())
        }))
    }

    async fn describe_collect(&self) -> DescribeCollect {
        let inner = self.inner.lock().await;
        let key = DataKey::external_array(TRIGGER_RESOURCE_SPEC, vec![-1, -1])
            .with_extra("filename", inner.filename.clone());
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
