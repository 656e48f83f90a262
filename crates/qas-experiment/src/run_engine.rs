//! RunEngine - executes fly-scan plans and emits run documents.
//!
//! The engine owns the device registries (flyers and trajectory motors),
//! pulls [`PlanCommand`]s from a [`Plan`] and turns them into device calls.
//! Every document it produces goes out on a broadcast channel.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐   start()   ┌─────────┐
//! │ Idle │────────────▶│ Running │
//! └──────┘             └────┬────┘
//!    ▲                      │ abort()
//!    │                      ▼
//!    │   unwound      ┌──────────┐
//!    └────────────────│ Aborting │
//!                     └──────────┘
//! ```
//!
//! `abort()` cancels the plan's [`CancellationToken`]. Every status wait in
//! the engine observes it, so a pending kickoff or complete fails instead of
//! hanging; the engine then unstages the flyers it started and closes the
//! open run with `exit_status = "abort"`.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = RunEngine::new(context);
//! engine.register_motor(mono).await;
//! engine.register_flyer(flyer).await;
//!
//! let mut docs = engine.subscribe();
//! let stops = engine.run(Box::new(FlyScan::new("Cu foil", "flyer_apb", "mono1"))).await?;
//! ```

use anyhow::{anyhow, bail, Context};
use qas_core::capabilities::{Acquirable, Flyable, Stageable, TrajectoryMotor};
use qas_core::context::BeamlineContext;
use qas_core::document::{
    new_uid, stream_for, DescriptorDoc, Document, EventDoc, StartDoc, StopDoc,
};
use qas_core::status::Status;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metadata::interp_filename;
use crate::plans::{Plan, PlanCommand};

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No plan running, ready to accept new plans
    Idle,
    /// Executing a plan
    Running,
    /// Unwinding the current plan (will return to Idle)
    Aborting,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Aborting => write!(f, "aborting"),
        }
    }
}

/// A queued plan waiting to be executed
struct QueuedPlan {
    plan: Box<dyn Plan>,
    plan_uid: String,
}

/// Per-plan bookkeeping
#[derive(Default)]
struct RunContext {
    /// Uid of the open run
    run_uid: Option<String>,
    /// stream -> (descriptor uid, last seq_num)
    descriptors: HashMap<String, (String, u32)>,
    num_events: u32,
    /// Statuses not yet waited on
    pending: Vec<Status>,
    /// Flyers kicked off and not yet collected
    active: Vec<Arc<dyn Acquirable>>,
    stops: Vec<StopDoc>,
}

impl RunContext {
    fn deactivate(&mut self, name: &str) {
        self.active.retain(|flyer| flyer.name() != name);
    }
}

/// The RunEngine orchestrates fly-scan execution
pub struct RunEngine {
    context: BeamlineContext,

    /// Current engine state
    state: RwLock<EngineState>,

    /// Flyers by name
    flyers: RwLock<HashMap<String, Arc<dyn Acquirable>>>,

    /// Trajectory motors by name
    motors: RwLock<HashMap<String, Arc<dyn TrajectoryMotor>>>,

    /// Queue of plans to execute
    plan_queue: Mutex<VecDeque<QueuedPlan>>,

    /// Document broadcast channel
    doc_sender: broadcast::Sender<Document>,

    /// Cancellation for the plan in flight
    run_token: Mutex<Option<CancellationToken>>,

    /// Why the plan in flight was aborted
    abort_reason: Mutex<Option<String>>,
}

impl RunEngine {
    /// Create a new RunEngine
    pub fn new(context: BeamlineContext) -> Self {
        let (doc_sender, _) = broadcast::channel(1024);

        Self {
            context,
            state: RwLock::new(EngineState::Idle),
            flyers: RwLock::new(HashMap::new()),
            motors: RwLock::new(HashMap::new()),
            plan_queue: Mutex::new(VecDeque::new()),
            doc_sender,
            run_token: Mutex::new(None),
            abort_reason: Mutex::new(None),
        }
    }

    /// Register a flyer under its own name
    pub async fn register_flyer(&self, flyer: Arc<dyn Acquirable>) {
        let name = flyer.name().to_string();
        debug!(flyer = %name, "Registered flyer");
        self.flyers.write().await.insert(name, flyer);
    }

    /// Register a trajectory motor under its own name
    pub async fn register_motor(&self, motor: Arc<dyn TrajectoryMotor>) {
        let name = motor.name().to_string();
        debug!(motor = %name, "Registered motor");
        self.motors.write().await.insert(name, motor);
    }

    /// Subscribe to document stream
    pub fn subscribe(&self) -> broadcast::Receiver<Document> {
        self.doc_sender.subscribe()
    }

    /// Get current engine state
    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Queue a plan for execution, returning its uid
    pub async fn queue(&self, plan: Box<dyn Plan>) -> String {
        let plan_uid = new_uid();
        info!(plan_uid = %plan_uid, plan_type = %plan.plan_type(), "Queueing plan");
        self.plan_queue
            .lock()
            .await
            .push_back(QueuedPlan {
                plan,
                plan_uid: plan_uid.clone(),
            });
        plan_uid
    }

    /// Number of plans waiting
    pub async fn queued(&self) -> usize {
        self.plan_queue.lock().await.len()
    }

    /// Execute the next queued plan.
    ///
    /// Returns the stop document of every run the plan opened. A plan that
    /// fails outside an open run has no stop document to carry the failure
    /// and returns the error instead.
    pub async fn start(&self) -> anyhow::Result<Vec<StopDoc>> {
        let queued = self
            .plan_queue
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| anyhow!("No plans in queue"))?;
        self.execute(queued).await
    }

    /// Queue `plan` and execute it right away
    pub async fn run(&self, plan: Box<dyn Plan>) -> anyhow::Result<Vec<StopDoc>> {
        let queued = QueuedPlan {
            plan,
            plan_uid: new_uid(),
        };
        self.execute(queued).await
    }

    /// Abort the plan in flight
    pub async fn abort(&self, reason: &str) -> anyhow::Result<()> {
        let current_state = *self.state.read().await;
        if current_state != EngineState::Running {
            bail!("Cannot abort: engine is {}", current_state);
        }
        info!(reason = %reason, "Abort requested");
        *self.abort_reason.lock().await = Some(reason.to_string());
        *self.state.write().await = EngineState::Aborting;
        if let Some(token) = self.run_token.lock().await.as_ref() {
            token.cancel();
        }
        Ok(())
    }

    async fn execute(&self, queued: QueuedPlan) -> anyhow::Result<Vec<StopDoc>> {
        let token = self.context.cancel_token().child_token();
        {
            let mut state = self.state.write().await;
            if *state != EngineState::Idle {
                bail!("Cannot start: engine is {}", *state);
            }
            *self.run_token.lock().await = Some(token.clone());
            *self.abort_reason.lock().await = None;
            *state = EngineState::Running;
        }
        info!(plan_uid = %queued.plan_uid, plan = %queued.plan.plan_name(), "Engine started");

        let result = self.execute_plan(queued, &token).await;

        *self.run_token.lock().await = None;
        *self.state.write().await = EngineState::Idle;
        result
    }

    async fn execute_plan(
        &self,
        mut queued: QueuedPlan,
        token: &CancellationToken,
    ) -> anyhow::Result<Vec<StopDoc>> {
        let plan = queued.plan.as_mut();
        plan.reset();
        let mut ctx = RunContext::default();

        let outcome = loop {
            if token.is_cancelled() {
                break Err(anyhow!("aborted"));
            }
            let Some(cmd) = plan.next_command() else {
                break Ok(());
            };
            if let Err(e) = self.process_command(cmd, &*plan, &mut ctx, token).await {
                break Err(e);
            }
        };

        let err = match outcome {
            Ok(()) => {
                if let Some(run_uid) = ctx.run_uid.take() {
                    warn!(run_uid = %run_uid, "Plan ended with an open run, closing it");
                    let stop = StopDoc::success(&run_uid, ctx.num_events);
                    self.close_run(&mut ctx, stop);
                }
                info!(plan_uid = %queued.plan_uid, runs = ctx.stops.len(), "Plan execution complete");
                return Ok(ctx.stops);
            }
            Err(e) => e,
        };

        let aborted = token.is_cancelled();
        let reason = if aborted {
            let reason = self.abort_reason.lock().await.clone();
            reason.unwrap_or_else(|| "shutdown".to_string())
        } else {
            format!("{err:#}")
        };
        if aborted {
            warn!(reason = %reason, "Plan aborted");
        } else {
            error!(error = %reason, "Plan execution failed");
        }

        for flyer in std::mem::take(&mut ctx.active) {
            if let Err(e) = flyer.unstage().await {
                warn!(flyer = %flyer.name(), error = %e, "Unstage during unwind failed");
            }
        }
        ctx.pending.clear();

        match ctx.run_uid.take() {
            Some(run_uid) => {
                let stop = if aborted {
                    StopDoc::abort(&run_uid, &reason, ctx.num_events)
                } else {
                    StopDoc::fail(&run_uid, &reason, ctx.num_events)
                };
                self.close_run(&mut ctx, stop);
                Ok(ctx.stops)
            }
            None if aborted => Ok(ctx.stops),
            None => Err(err),
        }
    }

    /// Process a single plan command
    async fn process_command(
        &self,
        cmd: PlanCommand,
        plan: &dyn Plan,
        ctx: &mut RunContext,
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        debug!(?cmd, "Processing command");

        match cmd {
            PlanCommand::PrepareTrajectory { motor } => {
                let motor = self.motor(&motor).await?;
                let status = motor
                    .prepare()
                    .await
                    .with_context(|| format!("prepare trajectory on {}", motor.name()))?;
                ctx.pending.push(status);
            }

            PlanCommand::OpenRun { metadata } => {
                if let Some(run_uid) = &ctx.run_uid {
                    bail!("Run {run_uid} is already open");
                }
                self.open_run(plan, metadata, ctx);
            }

            PlanCommand::Kickoff { flyer } => {
                let flyer = self.flyer(&flyer).await?;
                let status = flyer
                    .kickoff()
                    .await
                    .with_context(|| format!("kickoff {}", flyer.name()))?;
                ctx.deactivate(flyer.name());
                ctx.active.push(flyer);
                ctx.pending.push(status);
            }

            PlanCommand::Complete { flyer } => {
                let flyer = self.flyer(&flyer).await?;
                let status = flyer
                    .complete()
                    .await
                    .with_context(|| format!("complete {}", flyer.name()))?;
                ctx.pending.push(status);
            }

            PlanCommand::Wait => {
                for status in std::mem::take(&mut ctx.pending) {
                    status
                        .wait_with(token, None)
                        .await
                        .with_context(|| format!("waiting for {}", status.name()))?;
                }
            }

            PlanCommand::Collect { flyer } => {
                let flyer = self.flyer(&flyer).await?;
                self.collect(flyer.as_ref(), ctx).await?;
                ctx.deactivate(flyer.name());
            }

            PlanCommand::CloseRun => {
                let run_uid = ctx
                    .run_uid
                    .take()
                    .ok_or_else(|| anyhow!("No open run to close"))?;
                let stop = StopDoc::success(&run_uid, ctx.num_events);
                self.close_run(ctx, stop);
            }

            PlanCommand::Sleep { seconds } => {
                let duration = Duration::try_from_secs_f64(seconds)
                    .map_err(|e| anyhow!("invalid sleep of {seconds} s: {e}"))?;
                debug!(seconds = %seconds, "Sleeping");
                tokio::select! {
                    _ = sleep(duration) => {}
                    _ = token.cancelled() => bail!("sleep interrupted"),
                }
            }

            PlanCommand::Checkpoint { label } => {
                debug!(label = %label, "Checkpoint");
                if token.is_cancelled() {
                    bail!("aborted at checkpoint {label}");
                }
            }
        }
        Ok(())
    }

    fn open_run(
        &self,
        plan: &dyn Plan,
        metadata: BTreeMap<String, Value>,
        ctx: &mut RunContext,
    ) {
        let mut start_doc = StartDoc::new(plan.plan_type(), plan.plan_name());
        start_doc.plan_args = plan.plan_args();
        start_doc.metadata = metadata;
        if let Some(name) = start_doc.metadata.get("name").and_then(Value::as_str) {
            let paths = &self.context.settings().paths;
            let path = interp_filename(&paths.root, &paths.user_subdir, &start_doc.metadata, name);
            start_doc.metadata.insert(
                "interp_filename".to_string(),
                Value::from(path.display().to_string()),
            );
        }

        info!(run_uid = %start_doc.uid, plan = %start_doc.plan_name, "Run opened");
        ctx.run_uid = Some(start_doc.uid.clone());
        ctx.descriptors.clear();
        ctx.num_events = 0;
        self.emit_document(Document::Start(start_doc));
    }

    fn close_run(&self, ctx: &mut RunContext, stop: StopDoc) {
        info!(
            run_uid = %stop.run_uid,
            exit_status = %stop.exit_status,
            num_events = %stop.num_events,
            "Run closed"
        );
        ctx.stops.push(stop.clone());
        self.emit_document(Document::Stop(stop));
    }

    /// Descriptors for new streams, then asset documents, then events.
    async fn collect(&self, flyer: &dyn Acquirable, ctx: &mut RunContext) -> anyhow::Result<()> {
        let run_uid = ctx
            .run_uid
            .clone()
            .ok_or_else(|| anyhow!("Cannot collect {} outside a run", flyer.name()))?;

        // Describe before collect: collecting unstages the flyer.
        let describe = flyer.describe_collect().await;
        let points = flyer
            .collect()
            .await
            .with_context(|| format!("collect {}", flyer.name()))?;
        let assets = flyer.collect_asset_docs().await;

        for (stream, data_keys) in &describe {
            if ctx.descriptors.contains_key(stream) {
                continue;
            }
            let descriptor = DescriptorDoc::new(&run_uid, stream, data_keys.clone());
            ctx.descriptors
                .insert(stream.clone(), (descriptor.uid.clone(), 0));
            self.emit_document(Document::Descriptor(descriptor));
        }

        let num_assets = assets.len();
        for asset in assets {
            self.emit_document(Document::from_asset(&run_uid, asset));
        }

        let mut emitted = 0u32;
        for point in points {
            let Some(stream) = stream_for(&describe, &point) else {
                let fields: Vec<_> = point.data.keys().collect();
                warn!(flyer = %flyer.name(), ?fields, "Point matches no stream, dropped");
                continue;
            };
            let Some((descriptor_uid, seq_num)) = ctx.descriptors.get_mut(stream) else {
                continue;
            };
            *seq_num += 1;
            let event = EventDoc::from_point(&run_uid, descriptor_uid.as_str(), *seq_num, point);
            self.emit_document(Document::Event(event));
            emitted += 1;
        }
        ctx.num_events += emitted;

        info!(
            flyer = %flyer.name(),
            streams = describe.len(),
            assets = num_assets,
            events = emitted,
            "Collected"
        );
        Ok(())
    }

    async fn flyer(&self, name: &str) -> anyhow::Result<Arc<dyn Acquirable>> {
        self.flyers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown flyer '{name}'"))
    }

    async fn motor(&self, name: &str) -> anyhow::Result<Arc<dyn TrajectoryMotor>> {
        self.motors
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown motor '{name}'"))
    }

    fn emit_document(&self, doc: Document) {
        debug!(kind = doc.kind(), "Emitting document");
        if self.doc_sender.send(doc).is_err() {
            debug!("No document subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::FlyScan;
    use qas_core::config::Settings;

    #[tokio::test]
    async fn abort_requires_a_running_plan() {
        let engine = RunEngine::new(BeamlineContext::new(Settings::default()));
        assert_eq!(engine.state().await, EngineState::Idle);
        let err = engine.abort("nothing to stop").await.unwrap_err();
        assert!(err.to_string().contains("idle"));
    }

    #[tokio::test]
    async fn start_with_empty_queue_fails() {
        let engine = RunEngine::new(BeamlineContext::new(Settings::default()));
        assert!(engine.start().await.is_err());
    }

    #[tokio::test]
    async fn unknown_motor_fails_before_any_run_opens() {
        let engine = RunEngine::new(BeamlineContext::new(Settings::default()));
        let mut docs = engine.subscribe();
        engine
            .queue(Box::new(FlyScan::new("scan", "flyer_apb", "mono1")))
            .await;
        assert_eq!(engine.queued().await, 1);

        let err = engine.start().await.unwrap_err();
        assert!(err.to_string().contains("mono1"), "{err}");
        assert!(docs.try_recv().is_err());
        assert_eq!(engine.state().await, EngineState::Idle);
        assert_eq!(engine.queued().await, 0);
    }

    struct SleepOnce {
        seconds: f64,
        done: bool,
    }

    impl Plan for SleepOnce {
        fn plan_type(&self) -> &str {
            "sleep"
        }

        fn plan_name(&self) -> &str {
            "sleep_once"
        }

        fn plan_args(&self) -> BTreeMap<String, String> {
            BTreeMap::new()
        }

        fn flyers(&self) -> Vec<String> {
            Vec::new()
        }

        fn next_command(&mut self) -> Option<PlanCommand> {
            if self.done {
                return None;
            }
            self.done = true;
            Some(PlanCommand::Sleep {
                seconds: self.seconds,
            })
        }

        fn reset(&mut self) {
            self.done = false;
        }
    }

    #[tokio::test]
    async fn unrepresentable_sleep_fails_the_plan() {
        let engine = RunEngine::new(BeamlineContext::new(Settings::default()));
        for seconds in [f64::INFINITY, f64::NAN, -1.0] {
            let err = engine
                .run(Box::new(SleepOnce {
                    seconds,
                    done: false,
                }))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("invalid sleep"), "{err}");
            assert_eq!(engine.state().await, EngineState::Idle);
        }
    }

    #[tokio::test]
    async fn zero_sleep_completes() {
        let engine = RunEngine::new(BeamlineContext::new(Settings::default()));
        let stops = engine
            .run(Box::new(SleepOnce {
                seconds: 0.0,
                done: false,
            }))
            .await
            .unwrap();
        assert!(stops.is_empty());
    }
}
