//! Pizza-box acquisition channels.
//!
//! A [`Channel`] is one encoder, digital input or analog input of a
//! pizza-box. It owns two registers: the file path the box writes to and the
//! `ignore_sel` gate (0 = capture, 1 = ignore). Lifecycle:
//!
//! - `stage()` names the file, writes it to the box and queues a resource
//!   once staging has succeeded
//! - `kickoff()` opens the gate
//! - `complete()` closes the gate and queues the datums for the file
//! - `collect()` yields one point per datum
//! - `unstage()` closes the gate and returns to idle
//!
//! Channels that are not essential to a scan may be disconnected; they then
//! skip every hardware access and produce no data instead of failing the
//! scan.

use async_trait::async_trait;
use chrono::Utc;
use qas_core::capabilities::{Flyable, Stageable};
use qas_core::config::{ChannelSettings, ChunkPolicy};
use qas_core::document::{
    describe_single, new_uid, now_secs, AssetDoc, AssetQueue, CollectPoint, DataKey, Datum,
    DescribeCollect, Kwargs, Resource,
};
use qas_core::handlers::{chunk_count, count_rows};
use qas_core::paths::PathStrategy;
use qas_core::signal::SignalRef;
use qas_core::status::Status;
use qas_core::{AppResult, FlyerError, StatusError};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::state::{check_transition, AcqEvent, AcqState};
use crate::twin::{StageRole, TwinRegistry};

/// What a channel digitises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Incremental encoder
    Encoder,
    /// Digital input
    DigitalInput,
    /// Analog input
    AnalogInput,
}

impl ChannelKind {
    /// Handler tag of the channel file.
    pub fn resource_spec(self) -> &'static str {
        match self {
            ChannelKind::Encoder => "PIZZABOX_ENC_FILE_TXT",
            ChannelKind::DigitalInput => "PIZZABOX_DI_FILE_TXT",
            ChannelKind::AnalogInput => "PIZZABOX_AN_FILE_TXT",
        }
    }

    /// Data source tag.
    pub fn source(self) -> &'static str {
        match self {
            ChannelKind::Encoder => "pizzabox-enc-file",
            ChannelKind::DigitalInput => "pizzabox-di-file",
            ChannelKind::AnalogInput => "pizzabox-an-file",
        }
    }

    /// File name prefix.
    pub fn file_prefix(self) -> &'static str {
        match self {
            ChannelKind::Encoder => "en_",
            ChannelKind::DigitalInput => "di_",
            ChannelKind::AnalogInput => "an_",
        }
    }

    /// Columns per row in the channel file.
    pub fn columns(self) -> i64 {
        match self {
            ChannelKind::Encoder | ChannelKind::DigitalInput => 5,
            ChannelKind::AnalogInput => 4,
        }
    }
}

/// Registers of one channel.
#[derive(Clone)]
pub struct ChannelSignals {
    /// File path the box writes to
    pub filepath: SignalRef,
    /// Capture gate, 0 = capture
    pub ignore_sel: SignalRef,
}

/// Datum and file-wait parameters of a channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Rows per datum chunk
    pub chunk_size: usize,
    /// Datum generation policy
    pub chunking: ChunkPolicy,
    /// Interval between checks for the finished file
    pub file_poll_interval: Duration,
    /// Bound on waiting for the finished file
    pub file_timeout: Duration,
    /// Fail instead of skipping when disconnected
    pub essential: bool,
}

impl ChannelConfig {
    /// Configuration from settings; channels are essential by default.
    pub fn from_settings(settings: &ChannelSettings) -> Self {
        Self {
            chunk_size: settings.chunk_size,
            chunking: settings.chunking,
            file_poll_interval: settings.file_poll_interval,
            file_timeout: settings.file_timeout,
            essential: true,
        }
    }

    /// Mark the channel optional.
    pub fn optional(mut self) -> Self {
        self.essential = false;
        self
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from_settings(&ChannelSettings::default())
    }
}

/// Membership of a channel in a twin pair.
#[derive(Clone)]
pub struct TwinLink {
    /// Shared registry
    pub registry: Arc<TwinRegistry>,
    /// Pair id
    pub pair: String,
}

#[derive(Debug, Default)]
struct ChannelInner {
    state: AcqState,
    resource: Option<Resource>,
    local_file: Option<PathBuf>,
    counter: u64,
    datums: Vec<Datum>,
    skipped: bool,
}

/// One pizza-box channel.
pub struct Channel {
    name: String,
    kind: ChannelKind,
    signals: ChannelSignals,
    paths: Arc<dyn PathStrategy>,
    config: ChannelConfig,
    twin: Option<TwinLink>,
    inner: Mutex<ChannelInner>,
    assets: AssetQueue,
}

impl Channel {
    /// New channel writing files named by `paths`.
    pub fn new(
        name: impl Into<String>,
        kind: ChannelKind,
        signals: ChannelSignals,
        paths: Arc<dyn PathStrategy>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            signals,
            paths,
            config,
            twin: None,
            inner: Mutex::new(ChannelInner::default()),
            assets: AssetQueue::new(),
        }
    }

    /// Join a twin pair.
    pub fn with_twin(mut self, registry: Arc<TwinRegistry>, pair: &str) -> Self {
        self.twin = Some(TwinLink {
            registry,
            pair: pair.to_string(),
        });
        self
    }

    /// Channel kind.
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Current acquisition state.
    pub async fn state(&self) -> AcqState {
        self.inner.lock().await.state
    }

    /// Armed and capturing.
    pub async fn ready_to_collect(&self) -> bool {
        self.state().await == AcqState::Armed
    }

    /// Resource of the current acquisition.
    pub async fn resource(&self) -> Option<Resource> {
        self.inner.lock().await.resource.clone()
    }

    fn connected(&self) -> bool {
        self.signals.filepath.connected() && self.signals.ignore_sel.connected()
    }

    fn validate_twin(&self) -> AppResult<()> {
        match &self.twin {
            Some(link) => link.registry.validate(&link.pair, &self.name),
            None => Ok(()),
        }
    }

    /// Register a new output file with the box.
    async fn write_new_resource(&self) -> AppResult<Resource> {
        let uid = new_uid();
        let path = self.paths.checked_path(&self.name, &uid, Utc::now())?;
        self.signals.filepath.put(path.full.clone().into()).await?;
        let mut kwargs = Kwargs::new();
        kwargs.insert("chunk_size".into(), json!(self.config.chunk_size));
        let resource = Resource::new(
            self.kind.resource_spec(),
            path.root.clone(),
            path.relative(),
            kwargs,
        );
        Ok(resource)
    }

    async fn wait_for_file(&self, path: &Path) -> AppResult<usize> {
        let deadline = Instant::now() + self.config.file_timeout;
        loop {
            if let Ok(rows) = count_rows(path).await {
                if rows > 0 {
                    return Ok(rows);
                }
            }
            if Instant::now() >= deadline {
                error!(
                    device = %self.name,
                    path = %path.display(),
                    timeout = ?self.config.file_timeout,
                    invariant = "channel file written after capture stops",
                    "Channel file did not appear"
                );
                return Err(StatusError::Timeout(self.config.file_timeout).into());
            }
            tokio::time::sleep(self.config.file_poll_interval).await;
        }
    }

    /// Datum kwargs for the data written during this acquisition.
    async fn chunk_kwargs(&self, local_file: Option<&Path>) -> AppResult<Vec<Kwargs>> {
        let chunks = match (self.config.chunking, local_file) {
            (ChunkPolicy::FromFile, Some(path)) => {
                let rows = self.wait_for_file(path).await?;
                chunk_count(rows, self.config.chunk_size)
            }
            _ => 1,
        };
        Ok((0..chunks)
            .map(|n| {
                let mut kwargs = Kwargs::new();
                kwargs.insert("chunk_num".into(), json!(n));
                kwargs
            })
            .collect())
    }
}

#[async_trait]
impl Stageable for Channel {
    async fn stage(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let next = check_transition(&self.name, inner.state, AcqEvent::Stage)?;

        if !self.connected() {
            if self.config.essential {
                error!(
                    device = %self.name,
                    invariant = "essential channel connected",
                    "Channel not connected"
                );
                return Err(FlyerError::NotConnected {
                    device: self.name.clone(),
                });
            }
            warn!(device = %self.name, "Channel not connected, skipping this acquisition");
            inner.skipped = true;
            inner.resource = None;
            inner.datums.clear();
            inner.state = next;
            return Ok(());
        }

        let (resource, writer) = match &self.twin {
            None => (self.write_new_resource().await?, true),
            Some(link) => match link.registry.begin_stage(&link.pair, &self.name)? {
                StageRole::Mirror(resource) => (resource, false),
                StageRole::Writer => {
                    let written = match self.write_new_resource().await {
                        Ok(resource) => link
                            .registry
                            .publish_resource(&link.pair, &self.name, resource.clone())
                            .map(|()| resource),
                        Err(err) => Err(err),
                    };
                    match written {
                        Ok(resource) => (resource, true),
                        Err(err) => {
                            link.registry.release(&link.pair, &self.name)?;
                            return Err(err);
                        }
                    }
                }
            },
        };
        if writer {
            self.assets.push(AssetDoc::Resource(resource.clone()));
        }

        inner.local_file = Some(Path::new(&resource.root).join(&resource.resource_path));
        inner.resource = Some(resource);
        inner.skipped = false;
        inner.counter = 0;
        inner.datums.clear();
        inner.state = next;
        info!(device = %self.name, "Staged");
        Ok(())
    }

    async fn unstage(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let was_staged = inner.state != AcqState::Idle;
        inner.resource = None;
        inner.state = AcqState::Idle;

        let released = match &self.twin {
            Some(link) if was_staged && !inner.skipped => {
                link.registry.release(&link.pair, &self.name)
            }
            _ => Ok(()),
        };
        let gated = if !inner.skipped && self.connected() {
            self.signals.ignore_sel.put(1.into()).await
        } else {
            Ok(())
        };
        debug!(device = %self.name, "Unstaged");
        released.and(gated)
    }
}

#[async_trait]
impl Flyable for Channel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn kickoff(&self) -> AppResult<Status> {
        let mut inner = self.inner.lock().await;
        let next = check_transition(&self.name, inner.state, AcqEvent::Kickoff)?;
        if !inner.skipped {
            self.validate_twin()?;
            let first = match &self.twin {
                Some(link) => link.registry.claim_kickoff(&link.pair, &self.name)?,
                None => true,
            };
            if first {
                self.signals.ignore_sel.put(0.into()).await?;
            }
        }
        inner.state = next;
        debug!(device = %self.name, "Kicked off");
        Ok(Status::done(format!("{}_kickoff", self.name)))
    }

    async fn complete(&self) -> AppResult<Status> {
        let mut inner = self.inner.lock().await;
        let next = check_transition(&self.name, inner.state, AcqEvent::Complete)?;
        if inner.skipped {
            inner.state = next;
            return Ok(Status::done(format!("{}_complete", self.name)));
        }
        self.validate_twin()?;
        let first = match &self.twin {
            Some(link) => link.registry.claim_complete(&link.pair, &self.name)?,
            None => true,
        };
        if first {
            self.signals.ignore_sel.put(1.into()).await?;
        }

        let resource = inner.resource.clone().ok_or_else(|| {
            FlyerError::sequence(&self.name, "complete", "staged without a resource")
        })?;
        let column = match &self.twin {
            Some(link) => Some(link.registry.column(&link.pair, &self.name)?),
            None => None,
        };
        let local_file = inner.local_file.clone();
        for mut kwargs in self.chunk_kwargs(local_file.as_deref()).await? {
            let seq = match &self.twin {
                Some(link) => link.registry.next_sequence(&link.pair, &self.name)?,
                None => {
                    inner.counter += 1;
                    inner.counter - 1
                }
            };
            if let Some(column) = column {
                kwargs.insert("column".into(), json!(column));
            }
            let datum = Datum::numbered(&resource, seq, kwargs);
            self.assets.push(AssetDoc::Datum(datum.clone()));
            inner.datums.push(datum);
        }
        inner.state = next;
        info!(device = %self.name, datums = inner.datums.len(), "Completed");
        Ok(Status::done(format!("{}_complete", self.name)))
    }

    async fn describe_collect(&self) -> DescribeCollect {
        let inner = self.inner.lock().await;
        let filename = inner
            .local_file
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key = DataKey::external_array(
            self.kind.source(),
            vec![self.config.chunk_size as i64, self.kind.columns()],
        )
        .with_extra("filename", filename)
        .with_extra("devname", self.name.clone());
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
    use qas_core::paths::ShortPath;
    use qas_core::signal::{LocalSignal, PvValue, Signal};
    use crate::twin::TwinPair;

    struct Rig {
        filepath: Arc<LocalSignal>,
        ignore_sel: Arc<LocalSignal>,
    }

    impl Rig {
        fn new(prefix: &str) -> Self {
            Self {
                filepath: Arc::new(LocalSignal::new(format!("{prefix}:FilePath-SP"), "")),
                ignore_sel: Arc::new(LocalSignal::new(format!("{prefix}:IgnoreSel-SP"), 1)),
            }
        }

        fn channel(&self, name: &str, kind: ChannelKind, config: ChannelConfig) -> Channel {
            Channel::new(
                name,
                kind,
                ChannelSignals {
                    filepath: self.filepath.clone(),
                    ignore_sel: self.ignore_sel.clone(),
                },
                Arc::new(ShortPath::new("/epics/pb_data", kind.file_prefix()).with_max_len(Some(40))),
                config,
            )
        }
    }

    #[tokio::test]
    async fn lifecycle_produces_resource_then_datum() {
        let rig = Rig::new("PB9:ENC1");
        let ch = rig.channel("pb9_enc1", ChannelKind::Encoder, ChannelConfig::default());

        ch.stage().await.unwrap();
        let path = rig.filepath.value().as_text();
        assert!(path.starts_with("/epics/pb_data/en_"));

        ch.kickoff().await.unwrap();
        assert_eq!(rig.ignore_sel.value(), PvValue::Int(0));
        assert!(ch.ready_to_collect().await);

        ch.complete().await.unwrap();
        assert_eq!(rig.ignore_sel.value(), PvValue::Int(1));

        let docs = ch.collect_asset_docs().await;
        assert_eq!(docs.len(), 2);
        let AssetDoc::Resource(resource) = &docs[0] else {
            panic!("resource first")
        };
        assert_eq!(resource.spec, "PIZZABOX_ENC_FILE_TXT");
        assert_eq!(resource.resource_kwargs["chunk_size"], json!(1024));
        let AssetDoc::Datum(datum) = &docs[1] else {
            panic!("datum second")
        };
        assert_eq!(datum.datum_id, format!("{}/0", resource.uid));
        assert_eq!(datum.datum_kwargs["chunk_num"], json!(0));

        let points = ch.collect().await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].data["pb9_enc1"], json!(datum.datum_id));
        assert_eq!(points[0].filled["pb9_enc1"], false);
        assert!(ch.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_before_kickoff_is_a_sequence_fault() {
        let rig = Rig::new("PB9:ENC2");
        let ch = rig.channel("pb9_enc2", ChannelKind::Encoder, ChannelConfig::default());
        ch.stage().await.unwrap();
        let err = ch.complete().await.unwrap_err();
        assert!(matches!(err, FlyerError::Sequence { operation: "complete", .. }));
        ch.unstage().await.unwrap();
        assert_eq!(ch.state().await, AcqState::Idle);
    }

    #[tokio::test]
    async fn disconnected_optional_channel_is_skipped() {
        let rig = Rig::new("PB9:DI");
        rig.filepath.set_connected(false);
        let ch = rig.channel(
            "pb9_di",
            ChannelKind::DigitalInput,
            ChannelConfig::default().optional(),
        );
        ch.stage().await.unwrap();
        ch.kickoff().await.unwrap();
        ch.complete().await.unwrap();
        assert!(ch.collect_asset_docs().await.is_empty());
        assert!(ch.collect().await.unwrap().is_empty());
        ch.unstage().await.unwrap();
    }

    #[tokio::test]
    async fn disconnected_essential_channel_fails_stage() {
        let rig = Rig::new("PB9:ENC3");
        rig.ignore_sel.set_connected(false);
        let ch = rig.channel("pb9_enc3", ChannelKind::Encoder, ChannelConfig::default());
        assert!(matches!(
            ch.stage().await,
            Err(FlyerError::NotConnected { .. })
        ));
        assert_eq!(ch.state().await, AcqState::Idle);
    }

    #[tokio::test]
    async fn file_chunking_emits_one_datum_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let rig = Rig::new("PB9:ENC4");
        let config = ChannelConfig {
            chunk_size: 4,
            chunking: ChunkPolicy::FromFile,
            file_poll_interval: Duration::from_millis(5),
            file_timeout: Duration::from_secs(2),
            essential: true,
        };
        let ch = Channel::new(
            "pb9_enc4",
            ChannelKind::Encoder,
            ChannelSignals {
                filepath: rig.filepath.clone(),
                ignore_sel: rig.ignore_sel.clone(),
            },
            Arc::new(ShortPath::new(dir.path(), "en_")),
            config,
        );
        ch.stage().await.unwrap();
        let path = rig.filepath.value().as_text();
        let rows: String = (0..10).map(|i| format!("1 {i} 0 {i} 0\n")).collect();
        std::fs::write(&path, rows).unwrap();
        ch.kickoff().await.unwrap();
        ch.complete().await.unwrap();
        let points = ch.collect().await.unwrap();
        assert_eq!(points.len(), 3);
    }

    #[tokio::test]
    async fn twin_channels_share_one_resource() {
        let registry = Arc::new(TwinRegistry::new());
        registry
            .register(TwinPair::new("pb9_ai", "pb9_adc6", "pb9_adc7"))
            .unwrap();
        let rig = Rig::new("PB9:ADC");
        let adc6 = rig
            .channel("pb9_adc6", ChannelKind::AnalogInput, ChannelConfig::default())
            .with_twin(registry.clone(), "pb9_ai");
        let adc7 = rig
            .channel("pb9_adc7", ChannelKind::AnalogInput, ChannelConfig::default())
            .with_twin(registry.clone(), "pb9_ai");

        let mut puts = rig.filepath.monitor();
        adc7.stage().await.unwrap();
        adc6.stage().await.unwrap();
        // Only the writer touched the file path register.
        assert!(puts.next().await.is_some());
        assert!(tokio::time::timeout(Duration::from_millis(20), puts.next())
            .await
            .is_err());

        for ch in [&adc6, &adc7] {
            ch.kickoff().await.unwrap();
        }
        for ch in [&adc6, &adc7] {
            ch.complete().await.unwrap();
        }

        let mut docs = adc7.collect_asset_docs().await;
        docs.extend(adc6.collect_asset_docs().await);
        let resources: Vec<_> = docs.iter().filter(|d| d.kind() == "resource").collect();
        assert_eq!(resources.len(), 1);
        let datums: Vec<Datum> = docs
            .into_iter()
            .filter_map(|d| match d {
                AssetDoc::Datum(d) => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(datums.len(), 2);
        assert_eq!(datums[0].resource, datums[1].resource);
        assert_ne!(datums[0].datum_id, datums[1].datum_id);
        assert_eq!(datums[0].datum_kwargs["column"], json!(1));
        assert_eq!(datums[1].datum_kwargs["column"], json!(0));
    }

    #[tokio::test]
    async fn mirror_cannot_kick_off_after_writer_unstages() {
        let registry = Arc::new(TwinRegistry::new());
        registry
            .register(TwinPair::new("pb4_ai", "pb4_adc6", "pb4_adc7"))
            .unwrap();
        let rig = Rig::new("PB4:ADC");
        let adc6 = rig
            .channel("pb4_adc6", ChannelKind::AnalogInput, ChannelConfig::default())
            .with_twin(registry.clone(), "pb4_ai");
        let adc7 = rig
            .channel("pb4_adc7", ChannelKind::AnalogInput, ChannelConfig::default())
            .with_twin(registry.clone(), "pb4_ai");

        adc7.stage().await.unwrap();
        adc6.stage().await.unwrap();
        adc7.unstage().await.unwrap();

        let err = adc6.kickoff().await.unwrap_err();
        assert!(err.is_configuration(), "{err}");
        assert_eq!(rig.ignore_sel.value(), PvValue::Int(1));
        assert_eq!(adc6.state().await, AcqState::Staged);

        // Once the mirror is out too, the pair starts afresh.
        adc6.unstage().await.unwrap();
        adc6.stage().await.unwrap();
        adc7.stage().await.unwrap();
        adc7.kickoff().await.unwrap();
        assert_eq!(rig.ignore_sel.value(), PvValue::Int(0));
    }

    #[tokio::test]
    async fn unstage_returns_to_idle_when_gate_rejects_the_write() {
        let filepath = Arc::new(LocalSignal::new("PB9:ENC1:FilePath-SP", ""));
        let ch = Channel::new(
            "pb9_enc1",
            ChannelKind::Encoder,
            ChannelSignals {
                filepath,
                ignore_sel: Arc::new(LocalSignal::read_only("PB9:ENC1:IgnoreSel-SP", 1)),
            },
            Arc::new(ShortPath::new("/epics/pb_data", "en_")),
            ChannelConfig::default(),
        );
        ch.stage().await.unwrap();
        assert!(ch.unstage().await.is_err());
        assert_eq!(ch.state().await, AcqState::Idle);
        ch.stage().await.unwrap();
        assert_eq!(ch.state().await, AcqState::Staged);
    }

    #[tokio::test]
    async fn unregistered_twin_fails_with_configuration_fault() {
        let registry = Arc::new(TwinRegistry::new());
        let rig = Rig::new("PB9:ADC0");
        let ch = rig
            .channel("pb9_adc0", ChannelKind::AnalogInput, ChannelConfig::default())
            .with_twin(registry, "missing");
        let err = ch.stage().await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(ch.state().await, AcqState::Idle);
    }
}
