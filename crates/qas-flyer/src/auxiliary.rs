//! Area detectors triggered by the APB pulse output.
//!
//! An auxiliary detector is sized from the pulse frequency and trajectory
//! duration, captures one frame per pulse into an HDF5 file and drops its
//! `capture` register to 0 once the last frame is written. The flyer watches
//! that edge and then calls `complete()` to finalise the detector.

use async_trait::async_trait;
use chrono::Utc;
use qas_core::capabilities::Flyable;
use qas_core::document::{
    describe_single, new_uid, now_secs, AssetDoc, AssetQueue, CollectPoint, DataKey, Datum,
    DescribeCollect, Kwargs, Resource,
};
use qas_core::paths::{DatedPath, PathStrategy};
use qas_core::signal::{get_i64, SignalRef};
use qas_core::status::Status;
use qas_core::{AppResult, FlyerError};
use serde_json::json;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::state::{check_transition, AcqEvent, AcqState};

/// Detector driven by trigger pulses.
#[async_trait]
pub trait AuxiliaryDetector: Flyable {
    /// Detector family, recorded in run metadata.
    fn kind(&self) -> &'static str;

    /// Arm for `rate_hz` pulses over `duration` seconds plus one second.
    async fn prepare(&self, rate_hz: f64, duration: f64) -> AppResult<()>;

    /// Register that falls 1 -> 0 when capture has finished.
    fn capture_signal(&self) -> SignalRef;

    /// Restore the detector to its idle configuration.
    async fn unstage(&self) -> AppResult<()>;
}

fn frame_count(rate_hz: f64, duration: f64) -> AppResult<u64> {
    if !(rate_hz.is_finite() && rate_hz > 0.0) {
        return Err(FlyerError::Configuration(format!(
            "acquisition rate {rate_hz} Hz is not positive"
        )));
    }
    Ok((rate_hz * (duration + 1.0)) as u64)
}

#[derive(Debug, Default)]
struct AuxInner {
    state: AcqState,
    resource: Option<Resource>,
    filename: String,
    datums: Vec<Datum>,
}

/// Names the HDF5 file and builds its resource.
fn new_resource(device: &str, spec: &str, paths: &DatedPath) -> AppResult<(Resource, String)> {
    let path = paths.checked_path(device, &new_uid(), Utc::now())?;
    let mut kwargs = Kwargs::new();
    kwargs.insert("frame_per_point".into(), json!(1));
    let resource = Resource::new(
        spec,
        path.root.clone(),
        format!("{}.h5", path.relative()),
        kwargs,
    );
    Ok((resource, format!("{}.h5", path.full)))
}

// ---------------------------------------------------------------------------
// Xspress3
// ---------------------------------------------------------------------------

/// Registers of an Xspress3 in stream mode.
#[derive(Clone)]
pub struct XspressSignals {
    /// Acquire, 1 = running
    pub acquire: SignalRef,
    /// HDF5 capture, 1 = capturing
    pub capture: SignalRef,
    /// Frames written
    pub num_captured: SignalRef,
    /// Frames to capture
    pub total_points: SignalRef,
    /// Spectra per frame
    pub spectra_per_point: SignalRef,
    /// Trigger mode, 3 = TTL veto only
    pub trigger_mode: SignalRef,
    /// External trigger enable
    pub external_trig: SignalRef,
    /// File write mode, 2 = stream
    pub file_write_mode: SignalRef,
    /// HDF5 file path
    pub file_path: SignalRef,
}

/// Xspress3 fluorescence detector.
pub struct XspressStream {
    name: String,
    signals: XspressSignals,
    paths: DatedPath,
    inner: Mutex<AuxInner>,
    assets: AssetQueue,
}

impl XspressStream {
    /// New detector writing below `paths`.
    pub fn new(name: impl Into<String>, signals: XspressSignals, paths: DatedPath) -> Self {
        Self {
            name: name.into(),
            signals,
            paths,
            inner: Mutex::new(AuxInner::default()),
            assets: AssetQueue::new(),
        }
    }
}

#[async_trait]
impl AuxiliaryDetector for XspressStream {
    fn kind(&self) -> &'static str {
        "xspress3"
    }

    async fn prepare(&self, rate_hz: f64, duration: f64) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let next = check_transition(&self.name, inner.state, AcqEvent::Stage)?;
        let points = frame_count(rate_hz, duration)?;

        self.signals.file_write_mode.put(2.into()).await?;
        self.signals.external_trig.put(1.into()).await?;
        self.signals.total_points.put(points.into()).await?;
        self.signals.spectra_per_point.put(1.into()).await?;
        self.signals.trigger_mode.put(3.into()).await?;
        let (resource, filename) = new_resource(&self.name, "XSP3", &self.paths)?;
        self.signals.file_path.put(filename.clone().into()).await?;
        self.signals.capture.put(1.into()).await?;
        self.signals.acquire.put(1.into()).await?;
        self.assets.push(AssetDoc::Resource(resource.clone()));

        inner.resource = Some(resource);
        inner.filename = filename;
        inner.datums.clear();
        inner.state = next;
        info!(device = %self.name, points, "Prepared");
        Ok(())
    }

    fn capture_signal(&self) -> SignalRef {
        self.signals.capture.clone()
    }

    async fn unstage(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.resource = None;
        inner.state = AcqState::Idle;
        let results = [
            self.signals.acquire.put(0.into()).await,
            self.signals.capture.put(0.into()).await,
            self.signals.trigger_mode.put(1.into()).await,
        ];
        debug!(device = %self.name, "Unstaged");
        results.into_iter().collect()
    }
}

#[async_trait]
impl Flyable for XspressStream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn kickoff(&self) -> AppResult<Status> {
        let mut inner = self.inner.lock().await;
        inner.state = check_transition(&self.name, inner.state, AcqEvent::Kickoff)?;
        Ok(Status::done(format!("{}_kickoff", self.name)))
    }

    /// Stop acquiring and reference every captured frame.
    async fn complete(&self) -> AppResult<Status> {
        let mut inner = self.inner.lock().await;
        let next = check_transition(&self.name, inner.state, AcqEvent::Complete)?;
        let frames = get_i64(self.signals.num_captured.as_ref()).await?.max(0) as u64;
        self.signals.acquire.put(0.into()).await?;
        let resource = inner.resource.clone().ok_or_else(|| {
            FlyerError::sequence(&self.name, "complete", "prepared without a resource")
        })?;
        for frame in 0..frames {
            let mut kwargs = Kwargs::new();
            kwargs.insert("frame".into(), json!(frame));
            let datum = Datum::numbered(&resource, frame, kwargs);
            self.assets.push(AssetDoc::Datum(datum.clone()));
            inner.datums.push(datum);
        }
        inner.state = next;
        info!(device = %self.name, frames, "Completed");
        Ok(Status::done(format!("{}_complete", self.name)))
    }

    async fn describe_collect(&self) -> DescribeCollect {
        let inner = self.inner.lock().await;
        let key = DataKey::external_array("XSP3", vec![-1, -1])
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

// ---------------------------------------------------------------------------
// Pilatus
// ---------------------------------------------------------------------------

/// Regions of interest read out with every Pilatus image.
pub const PILATUS_ROIS: u8 = 4;

/// Registers of a Pilatus with an HDF5 plugin.
#[derive(Clone)]
pub struct PilatusSignals {
    /// Acquire, 1 = armed for external enable
    pub acquire: SignalRef,
    /// HDF5 capture, 1 = capturing
    pub capture: SignalRef,
    /// Images to capture
    pub num_images: SignalRef,
    /// Exposure time in seconds
    pub exposure_time: SignalRef,
    /// Image counter
    pub array_counter: SignalRef,
    /// Trigger mode, 2 = external trigger
    pub trigger_mode: SignalRef,
    /// Image mode, 1 = multiple
    pub image_mode: SignalRef,
    /// HDF5 file path
    pub file_path: SignalRef,
}

/// Pilatus area detector.
pub struct PilatusStream {
    name: String,
    signals: PilatusSignals,
    paths: DatedPath,
    inner: Mutex<AuxInner>,
    assets: AssetQueue,
}

impl PilatusStream {
    /// New detector writing below `paths`.
    pub fn new(name: impl Into<String>, signals: PilatusSignals, paths: DatedPath) -> Self {
        Self {
            name: name.into(),
            signals,
            paths,
            inner: Mutex::new(AuxInner::default()),
            assets: AssetQueue::new(),
        }
    }

    fn image_field(&self) -> String {
        format!("{}_image", self.name)
    }

    fn roi_field(&self, roi: u8) -> String {
        format!("{}_roi{roi}", self.name)
    }
}

#[async_trait]
impl AuxiliaryDetector for PilatusStream {
    fn kind(&self) -> &'static str {
        "pilatus"
    }

    async fn prepare(&self, rate_hz: f64, duration: f64) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        let next = check_transition(&self.name, inner.state, AcqEvent::Stage)?;
        let images = frame_count(rate_hz, duration)?;

        self.signals.num_images.put(images.into()).await?;
        self.signals.exposure_time.put((1.0 / rate_hz).into()).await?;
        self.signals.array_counter.put(0.into()).await?;
        self.signals.trigger_mode.put(2.into()).await?;
        self.signals.image_mode.put(1.into()).await?;
        let (resource, filename) = new_resource(&self.name, "PILATUS_HDF5", &self.paths)?;
        self.signals.file_path.put(filename.clone().into()).await?;
        self.signals.capture.put(1.into()).await?;
        self.assets.push(AssetDoc::Resource(resource.clone()));

        inner.resource = Some(resource);
        inner.filename = filename;
        inner.datums.clear();
        inner.state = next;
        info!(device = %self.name, images, "Prepared");
        Ok(())
    }

    fn capture_signal(&self) -> SignalRef {
        self.signals.capture.clone()
    }

    async fn unstage(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.resource = None;
        inner.state = AcqState::Idle;
        let results = [
            self.signals.acquire.put(0.into()).await,
            self.signals.trigger_mode.put(0.into()).await,
            self.signals.image_mode.put(0.into()).await,
            self.signals.num_images.put(1.into()).await,
            self.signals.exposure_time.put(1.0.into()).await,
        ];
        debug!(device = %self.name, "Unstaged");
        results.into_iter().collect()
    }
}

#[async_trait]
impl Flyable for PilatusStream {
    fn name(&self) -> &str {
        &self.name
    }

    /// Arm for external enable.
    async fn kickoff(&self) -> AppResult<Status> {
        let mut inner = self.inner.lock().await;
        let next = check_transition(&self.name, inner.state, AcqEvent::Kickoff)?;
        self.signals.acquire.put(1.into()).await?;
        inner.state = next;
        Ok(Status::done(format!("{}_kickoff", self.name)))
    }

    /// Stop acquisition and capture, then reference the image and ROIs.
    async fn complete(&self) -> AppResult<Status> {
        let mut inner = self.inner.lock().await;
        let next = check_transition(&self.name, inner.state, AcqEvent::Complete)?;
        self.signals.acquire.put(0.into()).await?;
        self.signals.capture.put(0.into()).await?;
        let resource = inner.resource.clone().ok_or_else(|| {
            FlyerError::sequence(&self.name, "complete", "prepared without a resource")
        })?;

        let mut kwargs = Kwargs::new();
        kwargs.insert("data_type".into(), json!("image"));
        let mut datums = vec![Datum::keyed(&resource, &self.image_field(), kwargs)];
        for roi in 1..=PILATUS_ROIS {
            let mut kwargs = Kwargs::new();
            kwargs.insert("data_type".into(), json!("roi"));
            kwargs.insert("roi_num".into(), json!(roi));
            datums.push(Datum::keyed(&resource, &self.roi_field(roi), kwargs));
        }
        for datum in &datums {
            self.assets.push(AssetDoc::Datum(datum.clone()));
        }
        inner.datums = datums;
        inner.state = next;
        Ok(Status::done(format!("{}_complete", self.name)))
    }

    async fn describe_collect(&self) -> DescribeCollect {
        let inner = self.inner.lock().await;
        let mut fields = BTreeMap::new();
        fields.insert(
            self.image_field(),
            DataKey::external_array("PILATUS_HDF5", vec![-1, -1, -1])
                .with_extra("filename", inner.filename.clone()),
        );
        for roi in 1..=PILATUS_ROIS {
            fields.insert(
                self.roi_field(roi),
                DataKey::external_array("PILATUS_HDF5", vec![-1])
                    .with_extra("filename", inner.filename.clone()),
            );
        }
        let mut describe = DescribeCollect::new();
        describe.insert(self.name.clone(), fields);
        describe
    }

    /// A single point holding every key.
    async fn collect(&self) -> AppResult<Vec<CollectPoint>> {
        let datums = std::mem::take(&mut self.inner.lock().await.datums);
        if datums.is_empty() {
            return Ok(Vec::new());
        }
        let mut point = CollectPoint::empty(now_secs());
        for datum in &datums {
            let field = datum
                .datum_id
                .rsplit('/')
                .next()
                .unwrap_or(datum.datum_id.as_str());
            point.add_reference(field, &datum.datum_id);
        }
        Ok(vec![point])
    }

    async fn collect_asset_docs(&self) -> Vec<AssetDoc> {
        self.assets.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qas_core::signal::{LocalSignal, PvValue};
    use std::sync::Arc;

    fn sig(name: &str, v: PvValue) -> Arc<LocalSignal> {
        Arc::new(LocalSignal::new(name, v))
    }

    fn paths() -> DatedPath {
        DatedPath::new("/nsls2/data/qas-new/legacy", "raw", "x3x")
    }

    #[tokio::test]
    async fn xspress_emits_one_datum_per_captured_frame() {
        let acquire = sig("XF:07BMB-ES{X3X:1}:Acquire", 0.into());
        let total = sig("XF:07BMB-ES{X3X:1}:NumImages", 0.into());
        let captured = sig("XF:07BMB-ES{X3X:1}:HDF5:NumCaptured_RBV", 0.into());
        let xs = XspressStream::new(
            "xs",
            XspressSignals {
                acquire: acquire.clone(),
                capture: sig("XF:07BMB-ES{X3X:1}:HDF5:Capture", 0.into()),
                num_captured: captured.clone(),
                total_points: total.clone(),
                spectra_per_point: sig("spectra", 0.into()),
                trigger_mode: sig("trigger_mode", 1.into()),
                external_trig: sig("external_trig", 0.into()),
                file_write_mode: sig("file_write_mode", 0.into()),
                file_path: sig("file_path", "".into()),
            },
            paths(),
        );
        xs.prepare(20.0, 10.0).await.unwrap();
        assert_eq!(total.value(), PvValue::Int(220));
        assert_eq!(acquire.value(), PvValue::Int(1));
        xs.kickoff().await.unwrap();
        captured.set(220);
        xs.complete().await.unwrap();
        assert_eq!(acquire.value(), PvValue::Int(0));

        let docs = xs.collect_asset_docs().await;
        assert_eq!(docs.len(), 221);
        let AssetDoc::Datum(last) = &docs[220] else {
            panic!("expected datum")
        };
        assert_eq!(last.datum_kwargs["frame"], json!(219));
        assert_eq!(xs.collect().await.unwrap().len(), 220);
        assert_eq!(xs.kind(), "xspress3");
    }

    #[tokio::test]
    async fn xspress_recovers_from_unreachable_acquire() {
        let acquire = sig("XF:07BMB-ES{X3X:1}:Acquire", 0.into());
        let trigger_mode = sig("trigger_mode", 1.into());
        let xs = XspressStream::new(
            "xs",
            XspressSignals {
                acquire: acquire.clone(),
                capture: sig("capture", 0.into()),
                num_captured: sig("num_captured", 0.into()),
                total_points: sig("total_points", 0.into()),
                spectra_per_point: sig("spectra", 0.into()),
                trigger_mode: trigger_mode.clone(),
                external_trig: sig("external_trig", 0.into()),
                file_write_mode: sig("file_write_mode", 0.into()),
                file_path: sig("file_path", "".into()),
            },
            paths(),
        );

        acquire.set_connected(false);
        assert!(xs.prepare(20.0, 10.0).await.is_err());
        assert!(xs.collect_asset_docs().await.is_empty());

        acquire.set_connected(true);
        xs.prepare(20.0, 10.0).await.unwrap();
        xs.kickoff().await.unwrap();
        acquire.set_connected(false);
        assert!(matches!(
            xs.unstage().await,
            Err(FlyerError::NotConnected { .. })
        ));
        assert_eq!(trigger_mode.value(), PvValue::Int(1));

        acquire.set_connected(true);
        xs.prepare(20.0, 10.0).await.unwrap();
        let resources = xs
            .collect_asset_docs()
            .await
            .iter()
            .filter(|d| d.kind() == "resource")
            .count();
        assert_eq!(resources, 2);
    }

    #[tokio::test]
    async fn pilatus_collects_image_and_rois_in_one_point() {
        let trigger_mode = sig("XF:07BM-ES{Det:PIL100k}:cam1:TriggerMode", 0.into());
        let exposure = sig("XF:07BM-ES{Det:PIL100k}:cam1:AcquireTime", 1.0.into());
        let pil = PilatusStream::new(
            "pilatus",
            PilatusSignals {
                acquire: sig("acquire", 0.into()),
                capture: sig("capture", 0.into()),
                num_images: sig("num_images", 1.into()),
                exposure_time: exposure.clone(),
                array_counter: sig("array_counter", 7.into()),
                trigger_mode: trigger_mode.clone(),
                image_mode: sig("image_mode", 0.into()),
                file_path: sig("file_path", "".into()),
            },
            paths(),
        );
        assert!(pil.complete().await.is_err());
        pil.prepare(50.0, 4.0).await.unwrap();
        assert_eq!(exposure.value(), PvValue::Float(0.02));
        assert_eq!(trigger_mode.value(), PvValue::Int(2));
        pil.kickoff().await.unwrap();
        pil.complete().await.unwrap();

        let describe = pil.describe_collect().await;
        assert_eq!(describe["pilatus"].len(), 5);
        let points = pil.collect().await.unwrap();
        assert_eq!(points.len(), 1);
        assert!(points[0].data.contains_key("pilatus_image"));
        assert!(points[0].data.contains_key("pilatus_roi4"));
        let docs = pil.collect_asset_docs().await;
        let roi2 = docs
            .iter()
            .find_map(|d| match d {
                AssetDoc::Datum(d) if d.datum_id.ends_with("pilatus_roi2") => Some(d),
                _ => None,
            })
            .unwrap();
        assert_eq!(roi2.datum_kwargs["roi_num"], json!(2));

        pil.unstage().await.unwrap();
        assert_eq!(trigger_mode.value(), PvValue::Int(0));
        assert_eq!(exposure.value(), PvValue::Float(1.0));
    }
}
