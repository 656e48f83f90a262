//! Simulated register sets.
//!
//! Each struct holds the concrete [`LocalSignal`]s of one device so the IOC
//! tasks and tests can drive and inspect them, and converts into the
//! `SignalRef` bundles the `qas-flyer` devices are built from.

// Field names mirror the device bundles in qas-flyer.
#![allow(missing_docs)]

use qas_core::signal::{LocalSignal, PvValue, SignalObserver, SignalRef};
use qas_flyer::auxiliary::{PilatusSignals, XspressSignals};
use qas_flyer::channel::ChannelSignals;
use qas_flyer::motor::MonoSignals;
use qas_flyer::streaming::ApbSignals;
use qas_flyer::trigger::TriggerSignals;
use std::sync::Arc;

/// Creates registers reporting to one observer.
#[derive(Clone)]
pub struct RegisterFactory {
    observer: Arc<dyn SignalObserver>,
}

impl RegisterFactory {
    /// Factory logging to `observer`.
    pub fn new(observer: Arc<dyn SignalObserver>) -> Self {
        Self { observer }
    }

    /// Client-writable register.
    pub fn rw(&self, name: &str, initial: impl Into<PvValue>) -> Arc<LocalSignal> {
        Arc::new(LocalSignal::new(name, initial).with_observer(self.observer.clone()))
    }

    /// Readback register, only the IOC changes it.
    pub fn ro(&self, name: &str, initial: impl Into<PvValue>) -> Arc<LocalSignal> {
        Arc::new(LocalSignal::read_only(name, initial).with_observer(self.observer.clone()))
    }
}

fn sref(sig: &Arc<LocalSignal>) -> SignalRef {
    sig.clone()
}

/// APB streaming box.
#[derive(Clone)]
pub struct ApbRegs {
    pub stream: Arc<LocalSignal>,
    pub streaming: Arc<LocalSignal>,
    pub acq_rate: Arc<LocalSignal>,
    pub stream_samples: Arc<LocalSignal>,
    pub trig_source: Arc<LocalSignal>,
    pub filename_bin: Arc<LocalSignal>,
    pub filename_txt: Arc<LocalSignal>,
    pub filebin_status: Arc<LocalSignal>,
    pub filetxt_status: Arc<LocalSignal>,
}

impl ApbRegs {
    /// Registers below `prefix`, sampling at `rate_khz`.
    pub fn new(f: &RegisterFactory, prefix: &str, rate_khz: f64) -> Self {
        Self {
            stream: f.rw(&format!("{prefix}Stream"), 0),
            streaming: f.ro(&format!("{prefix}Streaming-I"), 0),
            acq_rate: f.ro(&format!("{prefix}FA:Rate-I"), rate_khz),
            stream_samples: f.rw(&format!("{prefix}FA:Stream:Samples:OUT"), 0),
            trig_source: f.rw(&format!("{prefix}FA:Trig:Src-SP"), 0),
            filename_bin: f.rw(&format!("{prefix}FA:Stream:Bin:File-SP"), ""),
            filename_txt: f.rw(&format!("{prefix}FA:Stream:Txt:File-SP"), ""),
            filebin_status: f.ro(&format!("{prefix}FA:Stream:Bin:File:Status-I"), 0),
            filetxt_status: f.ro(&format!("{prefix}FA:Stream:Txt:File:Status-I"), 0),
        }
    }

    /// Bundle for [`ApbStream`](qas_flyer::streaming::ApbStream).
    pub fn signals(&self) -> ApbSignals {
        ApbSignals {
            stream: sref(&self.stream),
            streaming: sref(&self.streaming),
            acq_rate: sref(&self.acq_rate),
            stream_samples: sref(&self.stream_samples),
            trig_source: sref(&self.trig_source),
            filename_bin: sref(&self.filename_bin),
            filename_txt: sref(&self.filename_txt),
            filebin_status: sref(&self.filebin_status),
            filetxt_status: sref(&self.filetxt_status),
        }
    }
}

/// Monochromator trajectory controller.
#[derive(Clone)]
pub struct MonoRegs {
    pub lut_number_rbv: Arc<LocalSignal>,
    pub prepare_trajectory: Arc<LocalSignal>,
    pub trajectory_ready: Arc<LocalSignal>,
    pub start_trajectory: Arc<LocalSignal>,
    pub trajectory_running: Arc<LocalSignal>,
}

impl MonoRegs {
    /// Registers below `prefix` with `lut` selected.
    pub fn new(f: &RegisterFactory, prefix: &str, lut: i64) -> Self {
        Self {
            lut_number_rbv: f.ro(&format!("{prefix}TRAJ:LUT-Read"), lut),
            prepare_trajectory: f.rw(&format!("{prefix}PrepareTraj"), 0),
            trajectory_ready: f.ro(&format!("{prefix}TrajInitPlc-Read"), 0),
            start_trajectory: f.rw(&format!("{prefix}StartTraj"), 0),
            trajectory_running: f.ro(&format!("{prefix}TrajRunning"), 0),
        }
    }

    /// Bundle for [`Monochromator`](qas_flyer::motor::Monochromator).
    pub fn signals(&self) -> MonoSignals {
        MonoSignals {
            lut_number_rbv: sref(&self.lut_number_rbv),
            prepare_trajectory: sref(&self.prepare_trajectory),
            trajectory_ready: sref(&self.trajectory_ready),
            start_trajectory: sref(&self.start_trajectory),
            trajectory_running: sref(&self.trajectory_running),
        }
    }
}

/// APB pulse output.
#[derive(Clone)]
pub struct TriggerRegs {
    pub freq: Arc<LocalSignal>,
    pub max_counts: Arc<LocalSignal>,
    pub acquire: Arc<LocalSignal>,
    pub stream: Arc<LocalSignal>,
    pub filename: Arc<LocalSignal>,
    pub filebin_status: Arc<LocalSignal>,
}

impl TriggerRegs {
    /// Registers below `prefix` pulsing at `freq_hz`.
    pub fn new(f: &RegisterFactory, prefix: &str, freq_hz: f64) -> Self {
        Self {
            freq: f.rw(&format!("{prefix}Frequency-SP"), freq_hz),
            max_counts: f.rw(&format!("{prefix}MaxCount-SP"), 0),
            acquire: f.rw(&format!("{prefix}Mode-SP"), 0),
            stream: f.rw(&format!("{prefix}Stream:Mode-SP"), 0),
            filename: f.rw(&format!("{prefix}Filename-SP"), ""),
            filebin_status: f.ro(&format!("{prefix}File:Status-I"), 0),
        }
    }

    /// Bundle for [`ApbTrigger`](qas_flyer::trigger::ApbTrigger).
    pub fn signals(&self) -> TriggerSignals {
        TriggerSignals {
            freq: sref(&self.freq),
            max_counts: sref(&self.max_counts),
            acquire: sref(&self.acquire),
            stream: sref(&self.stream),
            filename: sref(&self.filename),
            filebin_status: sref(&self.filebin_status),
        }
    }
}

/// Xspress3 detector.
#[derive(Clone)]
pub struct XspressRegs {
    pub acquire: Arc<LocalSignal>,
    pub capture: Arc<LocalSignal>,
    pub num_captured: Arc<LocalSignal>,
    pub total_points: Arc<LocalSignal>,
    pub spectra_per_point: Arc<LocalSignal>,
    pub trigger_mode: Arc<LocalSignal>,
    pub external_trig: Arc<LocalSignal>,
    pub file_write_mode: Arc<LocalSignal>,
    pub file_path: Arc<LocalSignal>,
}

impl XspressRegs {
    /// Registers below `prefix`.
    pub fn new(f: &RegisterFactory, prefix: &str) -> Self {
        Self {
            acquire: f.rw(&format!("{prefix}det1:Acquire"), 0),
            capture: f.rw(&format!("{prefix}HDF1:Capture"), 0),
            num_captured: f.ro(&format!("{prefix}HDF1:NumCaptured_RBV"), 0),
            total_points: f.rw(&format!("{prefix}det1:NumImages"), 1),
            spectra_per_point: f.rw(&format!("{prefix}HDF1:NumFramesChunks"), 1),
            trigger_mode: f.rw(&format!("{prefix}det1:TriggerMode"), 1),
            external_trig: f.rw(&format!("{prefix}det1:EXTERNAL_TRIG"), 0),
            file_write_mode: f.rw(&format!("{prefix}HDF1:FileWriteMode"), 0),
            file_path: f.rw(&format!("{prefix}HDF1:FullFileName"), ""),
        }
    }

    /// Bundle for [`XspressStream`](qas_flyer::auxiliary::XspressStream).
    pub fn signals(&self) -> XspressSignals {
        XspressSignals {
            acquire: sref(&self.acquire),
            capture: sref(&self.capture),
            num_captured: sref(&self.num_captured),
            total_points: sref(&self.total_points),
            spectra_per_point: sref(&self.spectra_per_point),
            trigger_mode: sref(&self.trigger_mode),
            external_trig: sref(&self.external_trig),
            file_write_mode: sref(&self.file_write_mode),
            file_path: sref(&self.file_path),
        }
    }
}

/// Pilatus detector.
#[derive(Clone)]
pub struct PilatusRegs {
    pub acquire: Arc<LocalSignal>,
    pub capture: Arc<LocalSignal>,
    pub num_images: Arc<LocalSignal>,
    pub exposure_time: Arc<LocalSignal>,
    pub array_counter: Arc<LocalSignal>,
    pub trigger_mode: Arc<LocalSignal>,
    pub image_mode: Arc<LocalSignal>,
    pub file_path: Arc<LocalSignal>,
}

impl PilatusRegs {
    /// Registers below `prefix`.
    pub fn new(f: &RegisterFactory, prefix: &str) -> Self {
        Self {
            acquire: f.rw(&format!("{prefix}cam1:Acquire"), 0),
            capture: f.rw(&format!("{prefix}HDF1:Capture"), 0),
            num_images: f.rw(&format!("{prefix}cam1:NumImages"), 1),
            exposure_time: f.rw(&format!("{prefix}cam1:AcquireTime"), 1.0),
            array_counter: f.rw(&format!("{prefix}cam1:ArrayCounter"), 0),
            trigger_mode: f.rw(&format!("{prefix}cam1:TriggerMode"), 0),
            image_mode: f.rw(&format!("{prefix}cam1:ImageMode"), 0),
            file_path: f.rw(&format!("{prefix}HDF1:FullFileName"), ""),
        }
    }

    /// Bundle for [`PilatusStream`](qas_flyer::auxiliary::PilatusStream).
    pub fn signals(&self) -> PilatusSignals {
        PilatusSignals {
            acquire: sref(&self.acquire),
            capture: sref(&self.capture),
            num_images: sref(&self.num_images),
            exposure_time: sref(&self.exposure_time),
            array_counter: sref(&self.array_counter),
            trigger_mode: sref(&self.trigger_mode),
            image_mode: sref(&self.image_mode),
            file_path: sref(&self.file_path),
        }
    }
}

/// One pizza-box channel (shared by the two members of a twin pair).
#[derive(Clone)]
pub struct ChannelRegs {
    pub filepath: Arc<LocalSignal>,
    pub ignore_sel: Arc<LocalSignal>,
}

impl ChannelRegs {
    /// Registers below `prefix`.
    pub fn new(f: &RegisterFactory, prefix: &str) -> Self {
        Self {
            filepath: f.rw(&format!("{prefix}FilePath-SP"), ""),
            ignore_sel: f.rw(&format!("{prefix}IgnoreSel-Sel"), 1),
        }
    }

    /// Simulate a dropped connection.
    pub fn disconnect(&self) {
        self.filepath.set_connected(false);
        self.ignore_sel.set_connected(false);
    }

    /// Bundle for [`Channel`](qas_flyer::channel::Channel).
    pub fn signals(&self) -> ChannelSignals {
        ChannelSignals {
            filepath: sref(&self.filepath),
            ignore_sel: sref(&self.ignore_sel),
        }
    }
}
