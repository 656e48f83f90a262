//! Run engine and plans for QAS fly scans.
//!
//! - [`plans`] - [`Plan`] trait, [`PlanCommand`] values and the [`FlyScan`] plan
//! - [`run_engine`] - [`RunEngine`], which executes plans against registered
//!   flyers and motors and broadcasts run documents
//! - [`metadata`] - start-document metadata from the proposal store

pub mod metadata;
pub mod plans;
pub mod run_engine;

pub use metadata::{scan_metadata, ScanInfo};
pub use plans::{FlyScan, Plan, PlanCommand};
pub use run_engine::{EngineState, RunEngine};
