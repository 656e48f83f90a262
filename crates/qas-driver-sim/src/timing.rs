//! Simulated time.
//!
//! Nominal hardware durations (trajectory length, sample count over rate) are
//! multiplied by a time scale so a ten second trajectory can run in a tenth
//! of a second under test.

use std::time::Duration;

/// Delays of the simulated IOCs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimTiming {
    /// Simulated seconds per nominal second
    pub time_scale: f64,
    /// Stream enable to `streaming` rising
    pub streaming_delay: Duration,
    /// Acquisition end to file status rising
    pub file_save: Duration,
    /// Trajectory load time
    pub prepare: Duration,
}

impl SimTiming {
    /// Timing with every delay derived from `time_scale`.
    pub fn from_scale(time_scale: f64) -> Self {
        let time_scale = if time_scale.is_finite() && time_scale > 0.0 {
            time_scale
        } else {
            1.0
        };
        Self {
            time_scale,
            streaming_delay: Duration::from_secs_f64(0.5 * time_scale),
            file_save: Duration::from_secs_f64(0.2 * time_scale),
            prepare: Duration::from_secs_f64(0.5 * time_scale),
        }
    }

    /// Real hardware pace.
    pub fn realtime() -> Self {
        Self::from_scale(1.0)
    }

    /// Nominal `seconds` in simulated time.
    pub fn scaled(&self, seconds: f64) -> Duration {
        if seconds.is_finite() && seconds > 0.0 {
            Duration::from_secs_f64(seconds * self.time_scale)
        } else {
            Duration::ZERO
        }
    }
}

impl Default for SimTiming {
    fn default() -> Self {
        Self::from_scale(0.01)
    }
}
