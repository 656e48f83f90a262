//! Monochromator trajectory motor.
//!
//! The controller holds precomputed energy trajectories in look-up tables.
//! A fly scan prepares the selected table, then starts it once the primary
//! detector is streaming; `TrajRunning` falls when the motion ends.

use async_trait::async_trait;
use qas_core::capabilities::TrajectoryMotor;
use qas_core::config::TrajectorySettings;
use qas_core::signal::{Edge, SignalRef};
use qas_core::status::{Status, SubscriptionStatus};
use qas_core::{AppResult, CancellationToken, FlyerError};
use std::collections::BTreeMap;
use tracing::{error, info};

/// Sizes of the trajectories loaded into the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryTable {
    sizes: BTreeMap<String, u64>,
    servo_rate_hz: f64,
}

impl TrajectoryTable {
    /// Table from explicit sizes (points per LUT).
    pub fn new(sizes: BTreeMap<String, u64>, servo_rate_hz: f64) -> Self {
        Self {
            sizes,
            servo_rate_hz,
        }
    }

    /// Table from settings.
    pub fn from_settings(settings: &TrajectorySettings) -> Self {
        Self::new(settings.lut_sizes.clone(), settings.servo_rate_hz)
    }

    /// Duration of `lut` in seconds.
    pub fn duration(&self, lut: &str) -> Option<f64> {
        self.sizes
            .get(lut)
            .map(|size| *size as f64 / self.servo_rate_hz)
    }
}

/// Registers of the trajectory controller.
#[derive(Clone)]
pub struct MonoSignals {
    /// Selected look-up table
    pub lut_number_rbv: SignalRef,
    /// Load the selected trajectory
    pub prepare_trajectory: SignalRef,
    /// Trajectory load in progress, falls when loaded
    pub trajectory_ready: SignalRef,
    /// Start the loaded trajectory
    pub start_trajectory: SignalRef,
    /// Motion in progress
    pub trajectory_running: SignalRef,
}

/// Monochromator executing trajectories.
pub struct Monochromator {
    name: String,
    signals: MonoSignals,
    table: TrajectoryTable,
    cancel_root: CancellationToken,
}

impl Monochromator {
    /// New motor; statuses fail when `cancel_root` fires.
    pub fn new(
        name: impl Into<String>,
        signals: MonoSignals,
        table: TrajectoryTable,
        cancel_root: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            signals,
            table,
            cancel_root,
        }
    }

    /// Currently selected LUT.
    pub async fn selected_lut(&self) -> AppResult<String> {
        Ok(self.signals.lut_number_rbv.get().await?.as_text())
    }
}

#[async_trait]
impl TrajectoryMotor for Monochromator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self) -> AppResult<Status> {
        let status = SubscriptionStatus::new(
            format!("{}_prepare", self.name),
            self.signals.trajectory_ready.monitor(),
        )
        .cancel_on(&self.cancel_root)
        .edge(Edge::Falling);
        self.signals.prepare_trajectory.put(1.into()).await?;
        Ok(status)
    }

    async fn start(&self) -> AppResult<Status> {
        let status = SubscriptionStatus::new(
            format!("{}_trajectory", self.name),
            self.signals.trajectory_running.monitor(),
        )
        .cancel_on(&self.cancel_root)
        .edge(Edge::Falling);
        self.signals.start_trajectory.put(1.into()).await?;
        info!(device = %self.name, "Trajectory started");
        Ok(status)
    }

    async fn trajectory_duration(&self) -> AppResult<f64> {
        let lut = self.selected_lut().await?;
        self.table.duration(&lut).ok_or_else(|| {
            error!(
                device = %self.name,
                lut = %lut,
                invariant = "selected trajectory has a known size",
                "Unknown trajectory"
            );
            FlyerError::Configuration(format!("{}: no size known for LUT '{lut}'", self.name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qas_core::signal::{LocalSignal, PvValue};
    use std::sync::Arc;

    fn mono() -> (Monochromator, Arc<LocalSignal>, Arc<LocalSignal>) {
        let sig = |name: &str, v: PvValue| Arc::new(LocalSignal::new(format!("XF:07BMA-OP{{Mono:1-Ax:Bragg}}{name}"), v));
        let lut = sig("TRAJ:LUT-Read", 3.into());
        let running = sig("TRAJ:Running", 0.into());
        let mut sizes = BTreeMap::new();
        sizes.insert("3".to_string(), 160_000);
        let mono = Monochromator::new(
            "mono1",
            MonoSignals {
                lut_number_rbv: lut.clone(),
                prepare_trajectory: sig("PrepareTraj", 0.into()),
                trajectory_ready: sig("TrajInitPlc-Read", 0.into()),
                start_trajectory: sig("StartTraj", 0.into()),
                trajectory_running: running.clone(),
            },
            TrajectoryTable::new(sizes, 16000.0),
            CancellationToken::new(),
        );
        (mono, lut, running)
    }

    #[tokio::test]
    async fn duration_is_size_over_servo_rate() {
        let (mono, lut, _) = mono();
        assert_eq!(mono.trajectory_duration().await.unwrap(), 10.0);
        lut.set(9);
        assert!(mono.trajectory_duration().await.unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn start_resolves_when_motion_ends() {
        let (mono, _, running) = mono();
        let status = mono.start().await.unwrap();
        running.set(1);
        running.set(0);
        assert_eq!(status.wait().await, Ok(()));
    }
}
