//! Core types and traits for QAS fly-scan acquisition.
//!
//! This crate holds everything the flyer devices share but that is not tied
//! to one piece of hardware:
//!
//! - [`signal`] - remote process variables (get/put/monitor)
//! - [`status`] - asynchronous completion handles and edge subscriptions
//! - [`document`] - resource/datum asset documents and run documents
//! - [`capabilities`] - the stage/kickoff/complete/collect contract
//! - [`codec`] and [`handlers`] - pizza-box and APB file formats
//! - [`paths`] - output file naming strategies
//! - [`config`] and [`context`] - layered settings and the beamline context
//! - [`error`] - the shared error type

pub mod capabilities;
pub mod codec;
pub mod config;
pub mod context;
pub mod document;
pub mod error;
pub mod handlers;
pub mod paths;
pub mod signal;
pub mod status;

pub use error::{AppResult, FlyerError, StatusError};
pub use tokio_util::sync::CancellationToken;
