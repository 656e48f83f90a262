//! Plan system for fly scans.
//!
//! Plans do not touch hardware. They yield [`PlanCommand`] values and the
//! [`RunEngine`](crate::run_engine::RunEngine) carries them out against the
//! devices it has registered.
//!
//! # Plan Commands
//!
//! - `PrepareTrajectory` - load the trajectory into the motor controller
//! - `OpenRun` / `CloseRun` - bracket one run (start and stop documents)
//! - `Kickoff` / `Complete` - start and stop a flyer; both leave a pending status
//! - `Wait` - block until every pending status has resolved
//! - `Collect` - turn the flyer's data into descriptor, asset and event documents
//! - `Sleep` - pause between runs
//! - `Checkpoint` - safe point where an abort is honoured
//!
//! # Example Plan
//!
//! ```rust,ignore
//! let plan = FlyScan::new("Cu foil", "flyer_apb", "mono1").with_cycles(2);
//!
//! // Plan yields, per cycle:
//! // Checkpoint
//! // PrepareTrajectory("mono1"), Wait
//! // OpenRun { name: "Cu foil 0001" }
//! // Kickoff("flyer_apb"), Wait
//! // Complete("flyer_apb"), Wait
//! // Collect("flyer_apb")
//! // CloseRun
//! // Sleep (between cycles only)
//! ```

use serde_json::Value;
use std::collections::BTreeMap;

/// Commands that plans yield for the RunEngine to execute
#[derive(Debug, Clone, PartialEq)]
pub enum PlanCommand {
    /// Load the selected trajectory into a motor controller
    PrepareTrajectory {
        /// Motor to prepare
        motor: String,
    },
    /// Open a run and emit its start document
    OpenRun {
        /// Start-document metadata
        metadata: BTreeMap<String, Value>,
    },
    /// Kick off a flyer
    Kickoff {
        /// Flyer to start
        flyer: String,
    },
    /// Ask a flyer to finish
    Complete {
        /// Flyer to stop
        flyer: String,
    },
    /// Wait until every pending status has resolved
    Wait,
    /// Collect a flyer into the open run
    Collect {
        /// Flyer to collect
        flyer: String,
    },
    /// Close the open run with a successful stop document
    CloseRun,
    /// Sleep for a duration in seconds
    Sleep {
        /// Duration in seconds
        seconds: f64,
    },
    /// Checkpoint - safe point for abort
    Checkpoint {
        /// Checkpoint label
        label: String,
    },
}

/// Plan trait - all plans implement this to generate commands
pub trait Plan: Send + Sync {
    /// Plan type identifier (e.g., "fly_scan")
    fn plan_type(&self) -> &str;

    /// Plan name recorded in every start document
    fn plan_name(&self) -> &str;

    /// Plan arguments for documentation
    fn plan_args(&self) -> BTreeMap<String, String>;

    /// Flyers the plan kicks off
    fn flyers(&self) -> Vec<String>;

    /// Generate the next command, returning None when complete
    fn next_command(&mut self) -> Option<PlanCommand>;

    /// Reset the plan to start from the beginning
    fn reset(&mut self);
}

/// Repeated trajectory fly scan.
///
/// Every cycle prepares the trajectory, then runs the flyer once inside its
/// own run. The run's `name` is the scan name with a four-digit cycle suffix.
#[derive(Debug, Clone)]
pub struct FlyScan {
    name: String,
    flyer: String,
    motor: String,
    plan_name: String,
    n_cycles: usize,
    delay: f64,
    metadata: BTreeMap<String, Value>,

    // Execution state
    cycle: usize,
    step: FlyScanStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlyScanStep {
    Checkpoint,
    Prepare,
    WaitPrepared,
    OpenRun,
    Kickoff,
    WaitStarted,
    Complete,
    WaitDone,
    Collect,
    CloseRun,
    Delay,
}

impl FlyScan {
    /// One cycle of `flyer` driven by `motor`.
    pub fn new(name: &str, flyer: &str, motor: &str) -> Self {
        Self {
            name: name.to_string(),
            flyer: flyer.to_string(),
            motor: motor.to_string(),
            plan_name: "fly_scan_with_apb".to_string(),
            n_cycles: 1,
            delay: 0.0,
            metadata: BTreeMap::new(),
            cycle: 0,
            step: FlyScanStep::Checkpoint,
        }
    }

    /// Number of runs.
    pub fn with_cycles(mut self, n_cycles: usize) -> Self {
        self.n_cycles = n_cycles;
        self
    }

    /// Pause between runs, in seconds.
    pub fn with_delay(mut self, seconds: f64) -> Self {
        self.delay = seconds.max(0.0);
        self
    }

    /// Metadata merged into every start document.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Plan name recorded in the start documents.
    pub fn with_plan_name(mut self, plan_name: &str) -> Self {
        self.plan_name = plan_name.to_string();
        self
    }

    /// Number of runs this plan opens.
    pub fn n_cycles(&self) -> usize {
        self.n_cycles
    }

    /// Run name for cycle `index` (zero based).
    pub fn run_name(&self, index: usize) -> String {
        format!("{} {:04}", self.name, index + 1)
    }

    fn run_metadata(&self) -> BTreeMap<String, Value> {
        let mut metadata = self.metadata.clone();
        metadata.insert("name".to_string(), Value::from(self.run_name(self.cycle)));
        metadata.insert("cycle_index".to_string(), Value::from(self.cycle + 1));
        metadata
    }
}

impl Plan for FlyScan {
    fn plan_type(&self) -> &str {
        "fly_scan"
    }

    fn plan_name(&self) -> &str {
        &self.plan_name
    }

    fn plan_args(&self) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();
        args.insert("name".to_string(), self.name.clone());
        args.insert("flyer".to_string(), self.flyer.clone());
        args.insert("motor".to_string(), self.motor.clone());
        args.insert("n_cycles".to_string(), self.n_cycles.to_string());
        args.insert("delay".to_string(), self.delay.to_string());
        args
    }

    fn flyers(&self) -> Vec<String> {
        vec![self.flyer.clone()]
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        if self.cycle >= self.n_cycles {
            return None;
        }

        let cmd = match self.step {
            FlyScanStep::Checkpoint => {
                self.step = FlyScanStep::Prepare;
                PlanCommand::Checkpoint {
                    label: format!("cycle_{}", self.cycle + 1),
                }
            }
            FlyScanStep::Prepare => {
                self.step = FlyScanStep::WaitPrepared;
                PlanCommand::PrepareTrajectory {
                    motor: self.motor.clone(),
                }
            }
            FlyScanStep::WaitPrepared => {
                self.step = FlyScanStep::OpenRun;
                PlanCommand::Wait
            }
            FlyScanStep::OpenRun => {
                self.step = FlyScanStep::Kickoff;
                PlanCommand::OpenRun {
                    metadata: self.run_metadata(),
                }
            }
            FlyScanStep::Kickoff => {
                self.step = FlyScanStep::WaitStarted;
                PlanCommand::Kickoff {
                    flyer: self.flyer.clone(),
                }
            }
            FlyScanStep::WaitStarted => {
                self.step = FlyScanStep::Complete;
                PlanCommand::Wait
            }
            FlyScanStep::Complete => {
                self.step = FlyScanStep::WaitDone;
                PlanCommand::Complete {
                    flyer: self.flyer.clone(),
                }
            }
            FlyScanStep::WaitDone => {
                self.step = FlyScanStep::Collect;
                PlanCommand::Wait
            }
            FlyScanStep::Collect => {
                self.step = FlyScanStep::CloseRun;
                PlanCommand::Collect {
                    flyer: self.flyer.clone(),
                }
            }
            FlyScanStep::CloseRun => {
                self.step = FlyScanStep::Delay;
                PlanCommand::CloseRun
            }
            FlyScanStep::Delay => {
                self.cycle += 1;
                self.step = FlyScanStep::Checkpoint;
                if self.cycle >= self.n_cycles || self.delay <= 0.0 {
                    return self.next_command();
                }
                PlanCommand::Sleep {
                    seconds: self.delay,
                }
            }
        };

        Some(cmd)
    }

    fn reset(&mut self) {
        self.cycle = 0;
        self.step = FlyScanStep::Checkpoint;
    }
}
