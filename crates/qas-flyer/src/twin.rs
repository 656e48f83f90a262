//! Twin channel pairs.
//!
//! Some acquisition boards expose two logical channels that share one
//! physical trigger and one output file. The pair is registered once in a
//! [`TwinRegistry`] and each channel holds only the pair id; the registry owns
//! the shared state:
//!
//! - the first `stage()` in a pair is the writer: it names the file and
//!   creates the single [`Resource`]; the other channel mirrors it
//! - only the first `kickoff()` and `complete()` reach the hardware
//! - datum sequence numbers come from one counter, so ids never collide
//! - a mirror cannot kick off or complete once its writer has unstaged
//! - the pair resets when its last staged member unstages

use parking_lot::Mutex;
use qas_core::document::Resource;
use qas_core::{AppResult, FlyerError};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error};

/// Two channels sharing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwinPair {
    /// Pair id
    pub id: String,
    /// Channel writing column 0
    pub primary: String,
    /// Channel writing column 1
    pub secondary: String,
}

impl TwinPair {
    /// New pair description.
    pub fn new(id: &str, primary: &str, secondary: &str) -> Self {
        Self {
            id: id.to_string(),
            primary: primary.to_string(),
            secondary: secondary.to_string(),
        }
    }
}

/// Outcome of `stage()` for one member of a pair.
#[derive(Debug, Clone, PartialEq)]
pub enum StageRole {
    /// First in the pair: talk to the hardware and create the resource.
    Writer,
    /// Twin already staged: reuse its resource.
    Mirror(Resource),
}

#[derive(Debug, Default)]
struct PairState {
    writer: Option<String>,
    staged: HashSet<String>,
    resource: Option<Resource>,
    armed: bool,
    stopped: bool,
    next_sequence: u64,
}

#[derive(Debug)]
struct PairEntry {
    pair: TwinPair,
    state: PairState,
}

/// Arena of twin pairs keyed by pair id.
#[derive(Debug, Default)]
pub struct TwinRegistry {
    pairs: Mutex<HashMap<String, PairEntry>>,
}

impl TwinRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pair.
    pub fn register(&self, pair: TwinPair) -> AppResult<()> {
        if pair.primary == pair.secondary {
            return Err(FlyerError::Configuration(format!(
                "twin pair '{}' lists '{}' twice",
                pair.id, pair.primary
            )));
        }
        let mut pairs = self.pairs.lock();
        if pairs.contains_key(&pair.id) {
            return Err(FlyerError::Configuration(format!(
                "twin pair '{}' is already registered",
                pair.id
            )));
        }
        pairs.insert(
            pair.id.clone(),
            PairEntry {
                pair,
                state: PairState::default(),
            },
        );
        Ok(())
    }

    fn with_entry<T>(
        &self,
        pair_id: &str,
        channel: &str,
        f: impl FnOnce(&mut PairEntry) -> AppResult<T>,
    ) -> AppResult<T> {
        let mut pairs = self.pairs.lock();
        match pairs.get_mut(pair_id) {
            Some(entry) if entry.pair.primary == channel || entry.pair.secondary == channel => {
                f(entry)
            }
            _ => {
                error!(
                    device = channel,
                    pair = pair_id,
                    invariant = "twin pair registered and lists channel",
                    "Twin pair missing"
                );
                Err(FlyerError::TwinMissing {
                    device: channel.to_string(),
                    pair: pair_id.to_string(),
                })
            }
        }
    }

    /// Check that `channel` belongs to `pair_id`.
    pub fn validate(&self, pair_id: &str, channel: &str) -> AppResult<()> {
        self.with_entry(pair_id, channel, |_| Ok(()))
    }

    /// Column index of `channel` in its pair (primary 0, secondary 1).
    pub fn column(&self, pair_id: &str, channel: &str) -> AppResult<u8> {
        self.with_entry(pair_id, channel, |entry| {
            Ok(if entry.pair.primary == channel { 0 } else { 1 })
        })
    }

    /// Decide whether `channel` writes or mirrors for this acquisition.
    ///
    /// A twin that claimed the writer role but has not published its resource
    /// yet is not ready, which is a configuration fault. So is a twin still
    /// mirroring a writer that has already unstaged.
    pub fn begin_stage(&self, pair_id: &str, channel: &str) -> AppResult<StageRole> {
        self.with_entry(pair_id, channel, |entry| {
            if !entry.state.staged.is_empty() {
                ensure_writer_staged(entry, pair_id, channel)?;
            }
            match (&entry.state.writer, &entry.state.resource) {
                (_, Some(resource)) => {
                    debug!(device = channel, pair = pair_id, "Mirroring twin resource");
                    let role = StageRole::Mirror(resource.clone());
                    entry.state.staged.insert(channel.to_string());
                    Ok(role)
                }
                (Some(writer), None) if writer != channel => {
                    error!(
                        device = channel,
                        pair = pair_id,
                        twin = %writer,
                        invariant = "twin resource published before mirror stages",
                        "Twin not ready"
                    );
                    Err(FlyerError::Configuration(format!(
                        "{channel}: twin '{writer}' in pair '{pair_id}' is staging but has no resource"
                    )))
                }
                _ => {
                    entry.state = PairState::default();
                    entry.state.writer = Some(channel.to_string());
                    entry.state.staged.insert(channel.to_string());
                    Ok(StageRole::Writer)
                }
            }
        })
    }

    /// Publish the writer's resource to the pair.
    pub fn publish_resource(&self, pair_id: &str, channel: &str, resource: Resource) -> AppResult<()> {
        self.with_entry(pair_id, channel, |entry| {
            entry.state.resource = Some(resource);
            Ok(())
        })
    }

    /// True for the first kickoff in the pair.
    pub fn claim_kickoff(&self, pair_id: &str, channel: &str) -> AppResult<bool> {
        self.with_entry(pair_id, channel, |entry| {
            ensure_writer_staged(entry, pair_id, channel)?;
            let first = !entry.state.armed;
            entry.state.armed = true;
            Ok(first)
        })
    }

    /// True for the first complete in the pair.
    pub fn claim_complete(&self, pair_id: &str, channel: &str) -> AppResult<bool> {
        self.with_entry(pair_id, channel, |entry| {
            ensure_writer_staged(entry, pair_id, channel)?;
            let first = !entry.state.stopped;
            entry.state.stopped = true;
            Ok(first)
        })
    }

    /// Next datum sequence number for the shared resource.
    pub fn next_sequence(&self, pair_id: &str, channel: &str) -> AppResult<u64> {
        self.with_entry(pair_id, channel, |entry| {
            let seq = entry.state.next_sequence;
            entry.state.next_sequence += 1;
            Ok(seq)
        })
    }

    /// Drop `channel` from the acquisition; the last member out resets the
    /// pair.
    pub fn release(&self, pair_id: &str, channel: &str) -> AppResult<()> {
        self.with_entry(pair_id, channel, |entry| {
            entry.state.staged.remove(channel);
            if entry.state.staged.is_empty() {
                entry.state = PairState::default();
            }
            Ok(())
        })
    }
}

fn ensure_writer_staged(entry: &PairEntry, pair_id: &str, channel: &str) -> AppResult<()> {
    match &entry.state.writer {
        Some(writer) if entry.state.staged.contains(writer) => Ok(()),
        writer => {
            let writer = writer.as_deref().unwrap_or("none");
            error!(
                device = channel,
                pair = pair_id,
                twin = writer,
                invariant = "twin writer staged while its mirror acquires",
                "Twin not ready"
            );
            Err(FlyerError::Configuration(format!(
                "{channel}: writer '{writer}' of pair '{pair_id}' is not staged"
            )))
        }
    }
}
