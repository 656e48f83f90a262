//! A complete simulated QAS beamline.
//!
//! [`SimBeamline::build`] wires register sets, IOC tasks and the
//! `qas-flyer` devices together the way the beamline profile does, so a
//! [`Flyer`] of any variant can be built and run end to end in-process.

use qas_core::capabilities::{Acquirable, TrajectoryMotor};
use qas_core::config::Settings;
use qas_core::paths::{DatedPath, PathStrategy, ShortPath};
use qas_core::signal::SignalRef;
use qas_core::{AppResult, CancellationToken, FlyerError};
use qas_flyer::auxiliary::{AuxiliaryDetector, PilatusStream, XspressStream};
use qas_flyer::channel::{Channel, ChannelConfig, ChannelKind};
use qas_flyer::flyer::{Flyer, FlyerBuilder};
use qas_flyer::motor::{Monochromator, TrajectoryTable};
use qas_flyer::pizza_box::PizzaBox;
use qas_flyer::streaming::{ApbStream, StreamConfig};
use qas_flyer::trigger::ApbTrigger;
use qas_flyer::twin::{TwinPair, TwinRegistry};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::call_log::CallLog;
use crate::files::ChannelFileWriter;
use crate::ioc;
use crate::regs::{
    ApbRegs, ChannelRegs, MonoRegs, PilatusRegs, RegisterFactory, TriggerRegs, XspressRegs,
};
use crate::timing::SimTiming;

/// Encoder pizza-box used by every flyer.
pub const PIZZA_BOX: &str = "pb9";

/// Twin analog pair id.
pub const ADC_PAIR: &str = "pb4_adc67";

/// Knobs of the simulated hardware.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimOptions {
    /// Simulated seconds per nominal second
    pub time_scale: f64,
    /// Whether the streaming box can save its files
    pub mount_available: bool,
    /// Streaming rate readback in kHz
    pub acq_rate_khz: f64,
    /// Pulse output frequency in Hz
    pub trigger_freq_hz: f64,
    /// Selected trajectory LUT
    pub lut: i64,
    /// Points in the selected LUT, added to the table if missing
    pub lut_points: u64,
    /// Channels whose connection is down
    pub disconnected: Vec<String>,
    /// Channels allowed to be skipped when disconnected
    pub optional: Vec<String>,
    /// Channels (or `pb9` for the whole box) attached to every flyer
    pub flyer_channels: Vec<String>,
    /// Write synthetic channel files when capture stops
    pub write_channel_files: bool,
    /// Rows per synthetic channel file
    pub channel_rows: usize,
    /// Seed for synthetic data
    pub seed: Option<u64>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            time_scale: 0.01,
            mount_available: true,
            acq_rate_khz: 1.0,
            trigger_freq_hz: 20.0,
            lut: 3,
            lut_points: 160_000,
            disconnected: Vec::new(),
            optional: vec!["pb9_di".to_string()],
            flyer_channels: vec!["pb9_enc1".to_string()],
            write_channel_files: true,
            channel_rows: 100,
            seed: None,
        }
    }
}

/// The flyer configurations in use at QAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlyerVariant {
    /// Streaming box only
    Apb,
    /// Streaming box and pulse output
    ApbTrigger,
    /// Xspress3 behind the pulse output
    Xs,
    /// Pilatus behind the pulse output
    Pilatus,
}

impl FlyerVariant {
    /// Every variant.
    pub const ALL: [FlyerVariant; 4] = [
        FlyerVariant::Apb,
        FlyerVariant::ApbTrigger,
        FlyerVariant::Xs,
        FlyerVariant::Pilatus,
    ];

    /// Short name.
    pub fn as_str(self) -> &'static str {
        match self {
            FlyerVariant::Apb => "apb",
            FlyerVariant::ApbTrigger => "apb-trigger",
            FlyerVariant::Xs => "xs",
            FlyerVariant::Pilatus => "pilatus",
        }
    }

    /// Name of the flyer device.
    pub fn flyer_name(self) -> &'static str {
        match self {
            FlyerVariant::Apb => "flyer_apb",
            FlyerVariant::ApbTrigger => "flyer_apb_trigger",
            FlyerVariant::Xs => "flyer_xs",
            FlyerVariant::Pilatus => "flyer_pilatus",
        }
    }
}

impl fmt::Display for FlyerVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlyerVariant {
    type Err = FlyerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| FlyerError::Configuration(format!("unknown flyer variant '{s}'")))
    }
}

/// Register sets, for driving and inspecting the hardware from tests.
#[allow(missing_docs)]
pub struct SimRegisters {
    pub apb: ApbRegs,
    pub mono: MonoRegs,
    pub trigger_xs: TriggerRegs,
    pub trigger_pilatus: TriggerRegs,
    pub xs: XspressRegs,
    pub pilatus: PilatusRegs,
    /// Per channel; twin members share one entry under each name
    pub channels: BTreeMap<String, ChannelRegs>,
}

/// Devices built on the simulated registers.
#[allow(missing_docs)]
pub struct SimDevices {
    pub mono: Arc<Monochromator>,
    pub apb: Arc<ApbStream>,
    pub trigger_xs: Arc<ApbTrigger>,
    pub trigger_pilatus: Arc<ApbTrigger>,
    pub xs: Arc<XspressStream>,
    pub pilatus: Arc<PilatusStream>,
    pub pizza_box: Arc<PizzaBox>,
    pub channels: BTreeMap<String, Arc<Channel>>,
    pub twins: Arc<TwinRegistry>,
}

/// Simulated beamline; IOC tasks stop when it is dropped.
pub struct SimBeamline {
    /// Every put, update and monitor in order
    pub log: Arc<CallLog>,
    /// Hardware registers
    pub regs: SimRegisters,
    /// Devices on top of the registers
    pub devices: SimDevices,
    settings: Settings,
    options: SimOptions,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

const APB_PREFIX: &str = "XF:07BMB-CT{PBA:1}:";
const MONO_PREFIX: &str = "XF:07BMA-OP{Mono:1-Ax:Bragg}";

struct ChannelSpec {
    name: &'static str,
    prefix: &'static str,
    kind: ChannelKind,
}

const PB9_CHANNELS: [ChannelSpec; 5] = [
    ChannelSpec {
        name: "pb9_enc1",
        prefix: "XF:07BMB-CT{Enc:1}Chan0:",
        kind: ChannelKind::Encoder,
    },
    ChannelSpec {
        name: "pb9_enc2",
        prefix: "XF:07BMB-CT{Enc:1}Chan1:",
        kind: ChannelKind::Encoder,
    },
    ChannelSpec {
        name: "pb9_enc3",
        prefix: "XF:07BMB-CT{Enc:1}Chan2:",
        kind: ChannelKind::Encoder,
    },
    ChannelSpec {
        name: "pb9_enc4",
        prefix: "XF:07BMB-CT{Enc:1}Chan3:",
        kind: ChannelKind::Encoder,
    },
    ChannelSpec {
        name: "pb9_di",
        prefix: "XF:07BMB-CT{DI:1}",
        kind: ChannelKind::DigitalInput,
    },
];

const ADC_PAIR_PREFIX: &str = "XF:07BMB-CT{Ana:4}Adc6-7:";
const ADC_PAIR_MEMBERS: [&str; 2] = ["pb4_adc6", "pb4_adc7"];

impl SimBeamline {
    /// Build the beamline and start its IOC tasks.
    ///
    /// Must be called inside a Tokio runtime. Device statuses fail as
    /// cancelled when `cancel` fires.
    pub fn build(
        settings: &Settings,
        options: SimOptions,
        cancel: &CancellationToken,
    ) -> AppResult<Self> {
        let mut settings = settings.clone();
        settings
            .trajectory
            .lut_sizes
            .entry(options.lut.to_string())
            .or_insert(options.lut_points);
        let cancel = cancel.child_token();
        let timing = SimTiming::from_scale(options.time_scale);
        let log = Arc::new(CallLog::new());
        let factory = RegisterFactory::new(log.clone());

        let regs = SimRegisters {
            apb: ApbRegs::new(&factory, APB_PREFIX, options.acq_rate_khz),
            mono: MonoRegs::new(&factory, MONO_PREFIX, options.lut),
            trigger_xs: TriggerRegs::new(
                &factory,
                &format!("{APB_PREFIX}Pulse:1:"),
                options.trigger_freq_hz,
            ),
            trigger_pilatus: TriggerRegs::new(
                &factory,
                &format!("{APB_PREFIX}Pulse:2:"),
                options.trigger_freq_hz,
            ),
            xs: XspressRegs::new(&factory, "XF:07BMB-ES{Xsp:1}:"),
            pilatus: PilatusRegs::new(&factory, "XF:07BMB-ES{Det:PIL100k}:"),
            channels: BTreeMap::new(),
        };
        let mut sim = Self {
            log,
            devices: Self::build_devices(&settings, &regs, &cancel)?,
            regs,
            settings,
            options,
            cancel,
            tasks: Vec::new(),
        };
        sim.build_channels(&factory)?;
        sim.spawn_iocs(timing);
        info!(
            lut = sim.options.lut,
            time_scale = sim.options.time_scale,
            mount_available = sim.options.mount_available,
            "Simulated beamline up"
        );
        Ok(sim)
    }

    fn build_devices(
        settings: &Settings,
        regs: &SimRegisters,
        cancel: &CancellationToken,
    ) -> AppResult<SimDevices> {
        let dated = |subsystem: &str| {
            DatedPath::new(
                settings.paths.root.clone(),
                &settings.paths.raw_subdir,
                subsystem,
            )
        };
        Ok(SimDevices {
            mono: Arc::new(Monochromator::new(
                "mono1",
                regs.mono.signals(),
                TrajectoryTable::from_settings(&settings.trajectory),
                cancel.clone(),
            )),
            apb: Arc::new(ApbStream::new(
                "apb_ave",
                regs.apb.signals(),
                dated("apb"),
                StreamConfig::from_settings(settings),
                cancel.clone(),
            )),
            trigger_xs: Arc::new(ApbTrigger::from_settings(
                "apb_trigger_xs",
                regs.trigger_xs.signals(),
                settings,
                cancel.clone(),
            )),
            trigger_pilatus: Arc::new(ApbTrigger::from_settings(
                "apb_trigger_pil100k",
                regs.trigger_pilatus.signals(),
                settings,
                cancel.clone(),
            )),
            xs: Arc::new(XspressStream::new("xs", regs.xs.signals(), dated("xspress3"))),
            pilatus: Arc::new(PilatusStream::new(
                "pil100k",
                regs.pilatus.signals(),
                dated("pilatus"),
            )),
            pizza_box: Arc::new(PizzaBox::new(PIZZA_BOX, Vec::new(), Vec::new())),
            channels: BTreeMap::new(),
            twins: Arc::new(TwinRegistry::new()),
        })
    }

    fn channel_config(&self, name: &str) -> ChannelConfig {
        let config = ChannelConfig::from_settings(&self.settings.channels);
        if self.options.optional.iter().any(|o| o == name) {
            config.optional()
        } else {
            config
        }
    }

    fn channel_paths(&self, kind: ChannelKind) -> Arc<dyn PathStrategy> {
        Arc::new(
            ShortPath::new(self.settings.paths.pizzabox_dir.clone(), kind.file_prefix())
                .with_max_len(self.settings.channels.path_limit),
        )
    }

    fn writer(&self, kind: ChannelKind) -> Option<ChannelFileWriter> {
        self.options
            .write_channel_files
            .then(|| ChannelFileWriter::new(kind, self.options.channel_rows, self.options.seed))
    }

    fn build_channels(&mut self, factory: &RegisterFactory) -> AppResult<()> {
        let mut encoders = Vec::new();
        let mut digital = Vec::new();
        for spec in &PB9_CHANNELS {
            let regs = ChannelRegs::new(factory, spec.prefix);
            let channel = Arc::new(Channel::new(
                spec.name,
                spec.kind,
                regs.signals(),
                self.channel_paths(spec.kind),
                self.channel_config(spec.name),
            ));
            match spec.kind {
                ChannelKind::DigitalInput => digital.push(channel.clone()),
                _ => encoders.push(channel.clone()),
            }
            self.devices.channels.insert(spec.name.to_string(), channel);
            self.regs.channels.insert(spec.name.to_string(), regs);
        }
        self.devices.pizza_box = Arc::new(PizzaBox::new(PIZZA_BOX, encoders, digital));

        let [primary, secondary] = ADC_PAIR_MEMBERS;
        self.devices
            .twins
            .register(TwinPair::new(ADC_PAIR, primary, secondary))?;
        let regs = ChannelRegs::new(factory, ADC_PAIR_PREFIX);
        for name in ADC_PAIR_MEMBERS {
            let channel = Channel::new(
                name,
                ChannelKind::AnalogInput,
                regs.signals(),
                self.channel_paths(ChannelKind::AnalogInput),
                self.channel_config(name),
            )
            .with_twin(self.devices.twins.clone(), ADC_PAIR);
            self.devices.channels.insert(name.to_string(), Arc::new(channel));
            self.regs.channels.insert(name.to_string(), regs.clone());
        }

        for name in &self.options.disconnected {
            let regs = self.regs.channels.get(name).ok_or_else(|| {
                FlyerError::Configuration(format!("unknown channel '{name}' marked disconnected"))
            })?;
            regs.disconnect();
        }
        Ok(())
    }

    fn spawn_iocs(&mut self, timing: SimTiming) {
        let cancel = &self.cancel;
        self.tasks.push(ioc::spawn_apb(
            self.regs.apb.clone(),
            timing,
            self.options.mount_available,
            cancel.clone(),
        ));
        self.tasks.extend(ioc::spawn_mono(
            self.regs.mono.clone(),
            TrajectoryTable::from_settings(&self.settings.trajectory),
            timing,
            cancel.clone(),
        ));
        for trigger in [&self.regs.trigger_xs, &self.regs.trigger_pilatus] {
            self.tasks
                .push(ioc::spawn_trigger(trigger.clone(), timing, cancel.clone()));
        }
        self.tasks.push(ioc::spawn_xspress(
            self.regs.xs.clone(),
            self.regs.trigger_xs.filebin_status.clone(),
            cancel.clone(),
        ));
        self.tasks.push(ioc::spawn_pilatus(
            self.regs.pilatus.clone(),
            self.regs.trigger_pilatus.filebin_status.clone(),
            cancel.clone(),
        ));

        for spec in &PB9_CHANNELS {
            if let Some(regs) = self.regs.channels.get(spec.name) {
                self.tasks.push(ioc::spawn_channel(
                    regs.clone(),
                    self.writer(spec.kind),
                    cancel.clone(),
                ));
            }
        }
        // One writer for the pair: both columns live in the same file.
        if let Some(regs) = self.regs.channels.get(ADC_PAIR_MEMBERS[0]) {
            let writer = self
                .writer(ChannelKind::AnalogInput)
                .map(|w| w.with_analog_columns(2));
            self.tasks
                .push(ioc::spawn_channel(regs.clone(), writer, cancel.clone()));
        }
    }

    /// Settings the devices were built from, with the simulated LUT added.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Options in effect.
    pub fn options(&self) -> &SimOptions {
        &self.options
    }

    /// Token cancelling every IOC task and pending device status.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolve a channel name from [`SimOptions::flyer_channels`].
    pub fn acquirable(&self, name: &str) -> AppResult<Arc<dyn Acquirable>> {
        if name == PIZZA_BOX {
            return Ok(self.devices.pizza_box.clone());
        }
        self.devices
            .channels
            .get(name)
            .map(|ch| -> Arc<dyn Acquirable> { ch.clone() })
            .ok_or_else(|| FlyerError::Configuration(format!("unknown channel '{name}'")))
    }

    /// Builder for `variant` with the configured channels attached.
    pub fn flyer_builder(&self, variant: FlyerVariant) -> AppResult<FlyerBuilder> {
        let d = &self.devices;
        let motor: Arc<dyn TrajectoryMotor> = d.mono.clone();
        let name = variant.flyer_name();
        let builder = match variant {
            FlyerVariant::Apb => Flyer::apb(name, motor, d.apb.clone()),
            FlyerVariant::ApbTrigger => {
                Flyer::apb_with_trigger(name, motor, d.apb.clone(), d.trigger_xs.clone())
            }
            FlyerVariant::Xs => {
                let xs: Arc<dyn AuxiliaryDetector> = d.xs.clone();
                Flyer::xs(name, motor, d.apb.clone(), d.trigger_xs.clone(), xs)
            }
            FlyerVariant::Pilatus => {
                let pilatus: Arc<dyn AuxiliaryDetector> = d.pilatus.clone();
                Flyer::pilatus(name, motor, d.apb.clone(), d.trigger_pilatus.clone(), pilatus)
            }
        };
        let channels = self
            .options
            .flyer_channels
            .iter()
            .map(|name| self.acquirable(name))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(builder
            .channels(channels)
            .with_settings(&self.settings)
            .cancel_on(&self.cancel))
    }

    /// Build the flyer for `variant`.
    pub fn flyer(&self, variant: FlyerVariant) -> AppResult<Flyer> {
        self.flyer_builder(variant)?.build()
    }

    /// Register of `channel`'s file path, for inspection.
    pub fn channel_filepath(&self, channel: &str) -> Option<SignalRef> {
        self.regs
            .channels
            .get(channel)
            .map(|regs| -> SignalRef { regs.filepath.clone() })
    }
}

impl Drop for SimBeamline {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}
