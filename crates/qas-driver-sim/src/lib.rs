//! Simulated QAS hardware.
//!
//! In-process stand-ins for the IOCs a fly scan talks to: the APB streaming
//! box and its pulse outputs, the monochromator trajectory controller,
//! Xspress3 and Pilatus detectors, and pizza-box channels that write
//! synthetic data files. Every register reports to a [`CallLog`] so tests
//! can check the order in which devices touched the hardware.
//!
//! ```no_run
//! use qas_core::config::Settings;
//! use qas_core::CancellationToken;
//! use qas_driver_sim::{FlyerVariant, SimBeamline, SimOptions};
//!
//! # async fn run() -> qas_core::AppResult<()> {
//! let sim = SimBeamline::build(&Settings::default(), SimOptions::default(), &CancellationToken::new())?;
//! let flyer = sim.flyer(FlyerVariant::Apb)?;
//! # Ok(())
//! # }
//! ```

pub mod beamline;
pub mod call_log;
pub mod files;
pub mod ioc;
pub mod regs;
pub mod timing;

pub use beamline::{FlyerVariant, SimBeamline, SimOptions};
pub use call_log::{CallEntry, CallKind, CallLog};
pub use timing::SimTiming;
