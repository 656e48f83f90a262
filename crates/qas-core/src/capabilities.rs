//! Capability traits for fly-scan devices.
//!
//! The run engine drives every device through the same contract:
//!
//! ```text
//! stage() -> kickoff() -> complete() -> collect_asset_docs() / collect() -> unstage()
//! ```
//!
//! - [`Stageable`] - prepare and release a device around one acquisition
//! - [`Flyable`] - the asynchronous kickoff/complete/collect half
//! - [`Acquirable`] - both, the bound used for channels and flyers
//! - [`TrajectoryMotor`] - a motor that executes a precomputed trajectory
//!
//! `kickoff()` and `complete()` return a [`Status`] instead of blocking; the
//! caller decides how long to wait and with which cancellation token.

use async_trait::async_trait;

use crate::document::{AssetDoc, CollectPoint, DescribeCollect};
use crate::error::AppResult;
use crate::status::Status;

/// Prepare a device for one acquisition and release it afterwards.
#[async_trait]
pub trait Stageable: Send + Sync {
    /// Prepare for acquisition: name output files, register resources.
    ///
    /// # Errors
    /// Fails if the device is already staged, is disconnected, or the file
    /// path cannot be written to the hardware.
    async fn stage(&self) -> AppResult<()>;

    /// Return to idle from any state.
    async fn unstage(&self) -> AppResult<()>;
}

/// Continuous ("fly") acquisition.
#[async_trait]
pub trait Flyable: Send + Sync {
    /// Device name, also the name of its collect stream.
    fn name(&self) -> &str;

    /// Arm the device. The status resolves once acquisition is running.
    async fn kickoff(&self) -> AppResult<Status>;

    /// Stop the device. The status resolves once all data is on disk.
    ///
    /// # Errors
    /// Calling this before `kickoff()` is a usage-sequence fault.
    async fn complete(&self) -> AppResult<Status>;

    /// Schema of what `collect()` yields.
    async fn describe_collect(&self) -> DescribeCollect;

    /// Points referencing the data written during the last acquisition.
    async fn collect(&self) -> AppResult<Vec<CollectPoint>>;

    /// Queued resource and datum documents. Each document is returned once.
    async fn collect_asset_docs(&self) -> Vec<AssetDoc>;
}

/// Stageable and flyable.
pub trait Acquirable: Stageable + Flyable {}

impl<T: Stageable + Flyable + ?Sized> Acquirable for T {}

/// A motor that executes a trajectory loaded into its controller.
#[async_trait]
pub trait TrajectoryMotor: Send + Sync {
    /// Motor name.
    fn name(&self) -> &str;

    /// Load the selected trajectory into the controller.
    async fn prepare(&self) -> AppResult<Status>;

    /// Start the trajectory. The status resolves when the motion ends.
    async fn start(&self) -> AppResult<Status>;

    /// Duration of the selected trajectory in seconds.
    async fn trajectory_duration(&self) -> AppResult<f64>;
}
