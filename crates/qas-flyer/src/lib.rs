//! Fly-scan devices for the QAS beamline.
//!
//! - [`channel`] - pizza-box encoder, digital and analog channels
//! - [`pizza_box`] - a pizza-box driving its channels as one device
//! - [`twin`] - channels sharing one file
//! - [`streaming`] - the APB streaming box, primary detector of every flyer
//! - [`trigger`] - the APB pulse output
//! - [`auxiliary`] - Xspress3 and Pilatus detectors behind the pulse output
//! - [`motor`] - monochromator trajectories
//! - [`flyer`] - the orchestrator tying them together
//!
//! Every device moves through the state machines in [`state`]; calls out of
//! order fail with [`FlyerError::Sequence`](qas_core::FlyerError::Sequence).

pub mod auxiliary;
pub mod channel;
pub mod flyer;
pub mod motor;
pub mod pizza_box;
pub mod state;
pub mod streaming;
pub mod trigger;
pub mod twin;

pub use auxiliary::{AuxiliaryDetector, PilatusStream, XspressStream};
pub use channel::{Channel, ChannelConfig, ChannelKind, ChannelSignals};
pub use flyer::{Flyer, FlyerBuilder};
pub use motor::{Monochromator, TrajectoryTable};
pub use pizza_box::PizzaBox;
pub use state::{AcqState, FlyerState};
pub use streaming::{expected_points, ApbStream, StreamConfig};
pub use trigger::ApbTrigger;
pub use twin::{TwinPair, TwinRegistry};
