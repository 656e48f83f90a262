//! Acquisition state machines.
//!
//! Device state lives in an enum field and moves only along the rows of a
//! transition table. Anything not in the table is a usage-sequence fault.
//!
//! ```text
//! devices:  Idle --stage--> Staged --kickoff--> Armed --complete--> Completing
//!             ^                                                        |
//!             +----------------------- unstage (from any) -------------+
//!
//! flyers:   Idle --kickoff--> Flying --complete--> Draining --collect--> Idle
//! ```

use qas_core::{AppResult, FlyerError};
use std::fmt;
use tracing::error;

/// Device lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqEvent {
    /// `stage()`
    Stage,
    /// `kickoff()`
    Kickoff,
    /// `complete()`
    Complete,
    /// `unstage()`
    Unstage,
}

impl AcqEvent {
    /// Operation name used in errors.
    pub fn operation(self) -> &'static str {
        match self {
            AcqEvent::Stage => "stage",
            AcqEvent::Kickoff => "kickoff",
            AcqEvent::Complete => "complete",
            AcqEvent::Unstage => "unstage",
        }
    }

    fn invariant(self) -> &'static str {
        match self {
            AcqEvent::Stage => "stage only from idle",
            AcqEvent::Kickoff => "kickoff only after stage",
            AcqEvent::Complete => "complete only after kickoff",
            AcqEvent::Unstage => "unstage from any state",
        }
    }
}

/// Next state of `device` for `event`, logging and failing on illegal moves.
pub fn check_transition(device: &str, state: AcqState, event: AcqEvent) -> AppResult<AcqState> {
    state.next(event).ok_or_else(|| {
        error!(
            device,
            state = %state,
            operation = event.operation(),
            invariant = event.invariant(),
            "Illegal acquisition transition"
        );
        FlyerError::sequence(device, event.operation(), state)
    })
}

/// Device acquisition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcqState {
    /// Not prepared
    #[default]
    Idle,
    /// Output file named and registered
    Staged,
    /// Capturing
    Armed,
    /// Stopped, datums generated
    Completing,
}

const ACQ_TRANSITIONS: &[(AcqState, AcqEvent, AcqState)] = &[
    (AcqState::Idle, AcqEvent::Stage, AcqState::Staged),
    (AcqState::Staged, AcqEvent::Kickoff, AcqState::Armed),
    (AcqState::Armed, AcqEvent::Complete, AcqState::Completing),
    (AcqState::Idle, AcqEvent::Unstage, AcqState::Idle),
    (AcqState::Staged, AcqEvent::Unstage, AcqState::Idle),
    (AcqState::Armed, AcqEvent::Unstage, AcqState::Idle),
    (AcqState::Completing, AcqEvent::Unstage, AcqState::Idle),
];

impl AcqState {
    /// State after `event`, or `None` if the table does not allow it.
    pub fn next(self, event: AcqEvent) -> Option<AcqState> {
        ACQ_TRANSITIONS
            .iter()
            .find(|(from, ev, _)| *from == self && *ev == event)
            .map(|(_, _, to)| *to)
    }
}

impl fmt::Display for AcqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcqState::Idle => write!(f, "idle"),
            AcqState::Staged => write!(f, "staged"),
            AcqState::Armed => write!(f, "armed"),
            AcqState::Completing => write!(f, "completing"),
        }
    }
}

/// Flyer lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlyEvent {
    /// `kickoff()`
    Kickoff,
    /// `complete()`
    Complete,
    /// `collect()`
    Collect,
    /// `unstage()`
    Unstage,
}

impl FlyEvent {
    /// Operation name used in errors.
    pub fn operation(self) -> &'static str {
        match self {
            FlyEvent::Kickoff => "kickoff",
            FlyEvent::Complete => "complete",
            FlyEvent::Collect => "collect",
            FlyEvent::Unstage => "unstage",
        }
    }
}

/// Flyer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlyerState {
    /// Ready for a scan
    #[default]
    Idle,
    /// Kicked off, motor moving or about to
    Flying,
    /// Complete requested, data waiting to be collected
    Draining,
}

const FLY_TRANSITIONS: &[(FlyerState, FlyEvent, FlyerState)] = &[
    (FlyerState::Idle, FlyEvent::Kickoff, FlyerState::Flying),
    (FlyerState::Flying, FlyEvent::Complete, FlyerState::Draining),
    (FlyerState::Draining, FlyEvent::Collect, FlyerState::Idle),
    (FlyerState::Idle, FlyEvent::Unstage, FlyerState::Idle),
    (FlyerState::Flying, FlyEvent::Unstage, FlyerState::Idle),
    (FlyerState::Draining, FlyEvent::Unstage, FlyerState::Idle),
];

impl FlyerState {
    /// State after `event`, or `None` if the table does not allow it.
    pub fn next(self, event: FlyEvent) -> Option<FlyerState> {
        FLY_TRANSITIONS
            .iter()
            .find(|(from, ev, _)| *from == self && *ev == event)
            .map(|(_, _, to)| *to)
    }

    /// Whether a scan is in flight.
    pub fn in_flight(self) -> bool {
        !matches!(self, FlyerState::Idle)
    }
}

impl fmt::Display for FlyerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlyerState::Idle => write!(f, "idle"),
            FlyerState::Flying => write!(f, "flying"),
            FlyerState::Draining => write!(f, "draining"),
        }
    }
}
