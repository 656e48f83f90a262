//! Error types shared by every QAS device.
//!
//! `FlyerError` consolidates the failure classes a fly scan can hit:
//!
//! - **Usage-sequence faults** (`Sequence`, `Busy`): an operation was called in
//!   a state that does not allow it, e.g. `complete()` before `kickoff()`.
//! - **Configuration faults** (`Configuration`, `TwinMissing`, `Config`):
//!   inconsistent settings or a twin channel whose pair is not registered.
//! - **Connectivity faults** (`NotConnected`, `MountNotAvailable`, `Signal`):
//!   hardware or the network filesystem is not reachable.
//! - **Path faults** (`PathTooLong`): the hardware string register cannot hold
//!   the generated file name.
//! - **Status faults** (`Status`): an asynchronous status failed, timed out or
//!   was cancelled.
//!
//! Asynchronous statuses carry a [`StatusError`] instead of a `FlyerError`
//! because every waiter on a status must observe the same failure, so the
//! error has to be `Clone`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the flyer error type.
pub type AppResult<T> = std::result::Result<T, FlyerError>;

/// Failure observed through an asynchronous [`Status`](crate::status::Status).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    /// The operation behind the status failed.
    #[error("{0}")]
    Failed(String),

    /// The status did not resolve within the configured bound.
    #[error("status timed out after {0:?}")]
    Timeout(Duration),

    /// The status was cancelled before it resolved.
    #[error("status cancelled")]
    Cancelled,

    /// Signal updates were dropped before the awaited one could be seen.
    #[error("monitor on '{signal}' lagged, {skipped} updates dropped")]
    Lagged {
        /// Monitored signal
        signal: String,
        /// Updates lost
        skipped: u64,
    },
}

impl From<FlyerError> for StatusError {
    fn from(err: FlyerError) -> Self {
        match err {
            FlyerError::Status(inner) => inner,
            other => StatusError::Failed(other.to_string()),
        }
    }
}

/// Primary error type for QAS devices and flyers.
#[derive(Error, Debug)]
pub enum FlyerError {
    /// An operation was called out of order.
    #[error("{device}: cannot {operation} while {state}")]
    Sequence {
        /// Device that rejected the call
        device: String,
        /// Operation that was attempted
        operation: &'static str,
        /// State the device was in
        state: String,
    },

    /// Semantically invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A twin channel refers to a pair that does not exist or does not list it.
    #[error("{device}: twin pair '{pair}' is not registered or does not contain this channel")]
    TwinMissing {
        /// Channel with the broken twin link
        device: String,
        /// Pair identifier the channel points at
        pair: String,
    },

    /// An essential device is not connected.
    #[error("{device} is not connected")]
    NotConnected {
        /// Device name
        device: String,
    },

    /// The streaming box cannot write to the network filesystem.
    #[error("network filesystem at {mount_root} is not available to the streaming box")]
    MountNotAvailable {
        /// Mount root that was probed
        mount_root: String,
    },

    /// A generated file path does not fit the hardware string register.
    #[error("{device}: path '{path}' is {len} characters, limit is {limit}")]
    PathTooLong {
        /// Device that generated the path
        device: String,
        /// Offending path
        path: String,
        /// Path length
        len: usize,
        /// Register limit
        limit: usize,
    },

    /// A second fly scan was requested while one is in flight.
    #[error("{device} is busy: {reason}")]
    Busy {
        /// Flyer name
        device: String,
        /// What is in flight
        reason: String,
    },

    /// Failure of an asynchronous status.
    #[error("status failed: {0}")]
    Status(#[from] StatusError),

    /// Process variable access failure.
    #[error("signal '{signal}': {message}")]
    Signal {
        /// Signal name
        signal: String,
        /// Failure description
        message: String,
    },

    /// File or filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings could not be extracted from the configured providers.
    #[error("Config error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// JSON encoding or decoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlyerError {
    /// Build a usage-sequence fault.
    pub fn sequence(
        device: impl Into<String>,
        operation: &'static str,
        state: impl std::fmt::Display,
    ) -> Self {
        FlyerError::Sequence {
            device: device.into(),
            operation,
            state: state.to_string(),
        }
    }

    /// Build a signal access fault.
    pub fn signal(signal: impl Into<String>, message: impl Into<String>) -> Self {
        FlyerError::Signal {
            signal: signal.into(),
            message: message.into(),
        }
    }

    /// True for faults caused by configuration rather than hardware or usage.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FlyerError::Configuration(_) | FlyerError::TwinMissing { .. } | FlyerError::Config(_)
        )
    }
}

impl From<figment::Error> for FlyerError {
    fn from(err: figment::Error) -> Self {
        FlyerError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_round_trips_through_flyer_error() {
        let err = FlyerError::from(StatusError::Cancelled);
        assert_eq!(StatusError::from(err), StatusError::Cancelled);
    }

    #[test]
    fn other_errors_become_failed_statuses() {
        let err = FlyerError::sequence("enc1", "complete", "idle");
        match StatusError::from(err) {
            StatusError::Failed(msg) => assert!(msg.contains("cannot complete while idle")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn twin_faults_are_configuration_faults() {
        let err = FlyerError::TwinMissing {
            device: "enc1".into(),
            pair: "pb1".into(),
        };
        assert!(err.is_configuration());
        assert!(!FlyerError::Configuration("x".into()).to_string().is_empty());
        assert!(!FlyerError::NotConnected { device: "di".into() }.is_configuration());
    }
}
