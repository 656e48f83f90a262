//! Fly-scan orchestration.
//!
//! A [`Flyer`] coordinates one monochromator trajectory with the devices that
//! record it: the APB streaming box as primary detector, any number of
//! pizza-box channels, and for the triggered variants the APB pulse output
//! with an optional area detector behind it.
//!
//! Kickoff order:
//!
//! 1. storage mount check (cached per policy)
//! 2. auxiliary detector prepared, pulse output sized and staged
//! 3. subscribe to `streaming`
//! 4. stage the primary detector
//! 5. stage and kick off every channel
//! 6. arm the primary detector
//!
//! The rising edge of `streaming` starts the trajectory. Channels and the
//! primary detector are stopped only after the motion has ended.

use async_trait::async_trait;
use qas_core::capabilities::{Acquirable, Flyable, Stageable, TrajectoryMotor};
use qas_core::config::{MountCheckPolicy, Settings};
use qas_core::document::{merge_describe, AssetDoc, CollectPoint, DescribeCollect};
use qas_core::signal::{Edge, SignalMonitor};
use qas_core::status::{wait_for_edge, Status, SubscriptionStatus};
use qas_core::{AppResult, CancellationToken, FlyerError, StatusError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::auxiliary::AuxiliaryDetector;
use crate::state::{FlyEvent, FlyerState};
use crate::streaming::ApbStream;
use crate::trigger::ApbTrigger;

#[derive(Default)]
struct FlyerInner {
    state: FlyerState,
    mount_ok: bool,
    scan: Option<CancellationToken>,
    motion: Option<Status>,
    streaming: Option<SignalMonitor>,
    aux_capture: Option<SignalMonitor>,
}

/// Builder for [`Flyer`].
pub struct FlyerBuilder {
    name: String,
    motor: Arc<dyn TrajectoryMotor>,
    detector: Arc<ApbStream>,
    channels: Vec<Arc<dyn Acquirable>>,
    trigger: Option<Arc<ApbTrigger>>,
    aux: Option<Arc<dyn AuxiliaryDetector>>,
    mount_check: MountCheckPolicy,
    complete_timeout: Option<Duration>,
    kickoff_timeout: Option<Duration>,
    cancel_root: CancellationToken,
}

impl FlyerBuilder {
    /// Flyer driving `motor` with `detector` as primary detector.
    pub fn new(
        name: impl Into<String>,
        motor: Arc<dyn TrajectoryMotor>,
        detector: Arc<ApbStream>,
    ) -> Self {
        Self {
            name: name.into(),
            motor,
            detector,
            channels: Vec::new(),
            trigger: None,
            aux: None,
            mount_check: MountCheckPolicy::Once,
            complete_timeout: None,
            kickoff_timeout: None,
            cancel_root: CancellationToken::new(),
        }
    }

    /// Add a channel.
    pub fn channel(mut self, channel: Arc<dyn Acquirable>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Add several channels.
    pub fn channels(mut self, channels: impl IntoIterator<Item = Arc<dyn Acquirable>>) -> Self {
        self.channels.extend(channels);
        self
    }

    /// Use the APB pulse output.
    pub fn trigger(mut self, trigger: Arc<ApbTrigger>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Add a detector triggered by the pulse output.
    pub fn auxiliary(mut self, aux: Arc<dyn AuxiliaryDetector>) -> Self {
        self.aux = Some(aux);
        self
    }

    /// Mount check policy.
    pub fn mount_check(mut self, policy: MountCheckPolicy) -> Self {
        self.mount_check = policy;
        self
    }

    /// Bound `complete()`.
    pub fn complete_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.complete_timeout = timeout;
        self
    }

    /// Bound the wait for streaming to start.
    pub fn kickoff_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.kickoff_timeout = timeout;
        self
    }

    /// Policy and timeouts from settings.
    pub fn with_settings(self, settings: &Settings) -> Self {
        self.mount_check(settings.streaming.mount_check)
            .complete_timeout(settings.flyer.complete_timeout)
            .kickoff_timeout(settings.flyer.kickoff_timeout)
    }

    /// Fail pending statuses when `token` fires.
    pub fn cancel_on(mut self, token: &CancellationToken) -> Self {
        self.cancel_root = token.clone();
        self
    }

    /// Validate and build.
    pub fn build(self) -> AppResult<Flyer> {
        if self.aux.is_some() && self.trigger.is_none() {
            return Err(FlyerError::Configuration(format!(
                "{}: an auxiliary detector needs the APB pulse output",
                self.name
            )));
        }
        Ok(Flyer {
            name: self.name,
            motor: self.motor,
            detector: self.detector,
            channels: self.channels,
            trigger: self.trigger,
            aux: self.aux,
            mount_check: self.mount_check,
            complete_timeout: self.complete_timeout,
            kickoff_timeout: self.kickoff_timeout,
            cancel_root: self.cancel_root,
            inner: Mutex::new(FlyerInner::default()),
        })
    }
}

/// Fly-scan coordinator.
pub struct Flyer {
    name: String,
    motor: Arc<dyn TrajectoryMotor>,
    detector: Arc<ApbStream>,
    channels: Vec<Arc<dyn Acquirable>>,
    trigger: Option<Arc<ApbTrigger>>,
    aux: Option<Arc<dyn AuxiliaryDetector>>,
    mount_check: MountCheckPolicy,
    complete_timeout: Option<Duration>,
    kickoff_timeout: Option<Duration>,
    cancel_root: CancellationToken,
    inner: Mutex<FlyerInner>,
}

impl Flyer {
    /// Builder for a flyer with the streaming box only.
    pub fn apb(
        name: impl Into<String>,
        motor: Arc<dyn TrajectoryMotor>,
        detector: Arc<ApbStream>,
    ) -> FlyerBuilder {
        FlyerBuilder::new(name, motor, detector)
    }

    /// Builder for a flyer that also records the pulse output.
    pub fn apb_with_trigger(
        name: impl Into<String>,
        motor: Arc<dyn TrajectoryMotor>,
        detector: Arc<ApbStream>,
        trigger: Arc<ApbTrigger>,
    ) -> FlyerBuilder {
        FlyerBuilder::new(name, motor, detector).trigger(trigger)
    }

    /// Builder for a flyer with an Xspress3 behind the pulse output.
    pub fn xs(
        name: impl Into<String>,
        motor: Arc<dyn TrajectoryMotor>,
        detector: Arc<ApbStream>,
        trigger: Arc<ApbTrigger>,
        xs: Arc<dyn AuxiliaryDetector>,
    ) -> FlyerBuilder {
        Self::apb_with_trigger(name, motor, detector, trigger).auxiliary(xs)
    }

    /// Builder for a flyer with a Pilatus behind the pulse output.
    pub fn pilatus(
        name: impl Into<String>,
        motor: Arc<dyn TrajectoryMotor>,
        detector: Arc<ApbStream>,
        trigger: Arc<ApbTrigger>,
        pilatus: Arc<dyn AuxiliaryDetector>,
    ) -> FlyerBuilder {
        Self::apb_with_trigger(name, motor, detector, trigger).auxiliary(pilatus)
    }

    /// Current state.
    pub async fn state(&self) -> FlyerState {
        self.inner.lock().await.state
    }

    /// Motor driven by this flyer.
    pub fn motor(&self) -> &Arc<dyn TrajectoryMotor> {
        &self.motor
    }

    /// Family of the auxiliary detector, if any.
    pub fn aux_kind(&self) -> Option<&'static str> {
        self.aux.as_ref().map(|aux| aux.kind())
    }

    fn sequence_fault(&self, state: FlyerState, event: FlyEvent) -> FlyerError {
        error!(
            device = %self.name,
            state = %state,
            operation = event.operation(),
            invariant = "complete and collect follow kickoff",
            "Illegal flyer transition"
        );
        FlyerError::sequence(&self.name, event.operation(), state)
    }

    /// Unstage every constituent, reporting the first failure.
    async fn unstage_all(&self) -> AppResult<()> {
        let mut results = vec![self.detector.unstage().await];
        for ch in &self.channels {
            results.push(ch.unstage().await);
        }
        if let Some(trigger) = &self.trigger {
            results.push(trigger.unstage().await);
        }
        if let Some(aux) = &self.aux {
            results.push(aux.unstage().await);
        }
        let mut first_err = None;
        for err in results.into_iter().filter_map(Result::err) {
            warn!(device = %self.name, error = %err, "Unstage failed");
            first_err.get_or_insert(err);
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Steps 2 to 6 of kickoff; the caller unwinds on failure.
    async fn arm(&self, inner: &mut FlyerInner, scan: &CancellationToken) -> AppResult<Status> {
        let duration = self.motor.trajectory_duration().await?;

        if let Some(trigger) = &self.trigger {
            if let Some(aux) = &self.aux {
                let rate = trigger.freq().await?;
                aux.prepare(rate, duration).await?;
            }
            trigger.prepare_to_fly(duration).await?;
            trigger.stage().await?;
        }

        let mut rising = self.detector.streaming_monitor();
        inner.streaming = Some(self.detector.streaming_monitor());

        self.detector.stage_for(duration).await?;

        for ch in &self.channels {
            ch.stage().await?;
            ch.kickoff().await?;
        }
        if let Some(trigger) = &self.trigger {
            trigger.kickoff().await?;
        }
        if let Some(aux) = &self.aux {
            inner.aux_capture = Some(aux.capture_signal().monitor());
            aux.kickoff().await?;
        }

        let started = Status::new(format!("{}_kickoff", self.name));
        let started_tx = started.clone();
        let motor = self.motor.clone();
        let cancel = scan.clone();
        let kickoff_timeout = self.kickoff_timeout;
        let motion = Status::spawn(format!("{}_motion", self.name), async move {
            let start = async {
                let edge = wait_for_edge(&mut rising, Edge::Rising, &cancel);
                match kickoff_timeout {
                    Some(limit) => tokio::time::timeout(limit, edge)
                        .await
                        .unwrap_or(Err(StatusError::Timeout(limit)))?,
                    None => edge.await?,
                };
                Ok::<Status, StatusError>(motor.start().await?)
            };
            match start.await {
                Ok(trajectory) => {
                    started_tx.finish();
                    trajectory.wait_with(&cancel, None).await
                }
                Err(err) => {
                    started_tx.fail(err.clone());
                    Err(err)
                }
            }
        });
        inner.motion = Some(motion);

        self.detector.kickoff().await?;
        info!(device = %self.name, duration, "Kicked off");
        Ok(started)
    }
}

#[async_trait]
impl Stageable for Flyer {
    /// Constituents are staged by `kickoff()`.
    async fn stage(&self) -> AppResult<()> {
        Ok(())
    }

    /// Abort: release every constituent and return to idle.
    async fn unstage(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(scan) = inner.scan.take() {
            scan.cancel();
        }
        inner.motion = None;
        inner.streaming = None;
        inner.aux_capture = None;
        inner.state = FlyerState::Idle;
        let result = self.unstage_all().await;
        debug!(device = %self.name, "Unstaged");
        result
    }
}

#[async_trait]
impl Flyable for Flyer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn kickoff(&self) -> AppResult<Status> {
        let mut inner = self.inner.lock().await;
        let Some(next) = inner.state.next(FlyEvent::Kickoff) else {
            warn!(device = %self.name, state = %inner.state, "Fly scan already in flight");
            return Err(FlyerError::Busy {
                device: self.name.clone(),
                reason: format!("fly scan {}", inner.state),
            });
        };

        let check = match self.mount_check {
            MountCheckPolicy::Disabled => false,
            MountCheckPolicy::Once => !inner.mount_ok,
            MountCheckPolicy::EveryScan => true,
        };
        if check {
            self.detector.check_mount().await?;
            inner.mount_ok = true;
        }

        let scan = self.cancel_root.child_token();
        match self.arm(&mut inner, &scan).await {
            Ok(started) => {
                inner.scan = Some(scan);
                inner.state = next;
                Ok(started)
            }
            Err(err) => {
                error!(device = %self.name, error = %err, "Kickoff failed, unstaging");
                scan.cancel();
                inner.motion = None;
                inner.streaming = None;
                inner.aux_capture = None;
                if let Err(unstage_err) = self.unstage_all().await {
                    warn!(device = %self.name, error = %unstage_err, "Cleanup after failed kickoff");
                }
                Err(err)
            }
        }
    }

    async fn complete(&self) -> AppResult<Status> {
        let mut inner = self.inner.lock().await;
        let state = inner.state;
        let next = state
            .next(FlyEvent::Complete)
            .ok_or_else(|| self.sequence_fault(state, FlyEvent::Complete))?;
        let motion = inner
            .motion
            .take()
            .ok_or_else(|| self.sequence_fault(state, FlyEvent::Complete))?;
        let scan = inner
            .scan
            .clone()
            .unwrap_or_else(|| self.cancel_root.child_token());

        let streaming = inner
            .streaming
            .take()
            .unwrap_or_else(|| self.detector.streaming_monitor());
        let mut statuses = vec![SubscriptionStatus::new(
            format!("{}_streaming", self.name),
            streaming,
        )
        .cancel_on(&scan)
        .edge(Edge::Falling)];

        let detector = self.detector.clone();
        let channels = self.channels.clone();
        let trigger = self.trigger.clone();
        let token = scan.clone();
        statuses.push(Status::spawn(
            format!("{}_devices", self.name),
            async move {
                motion.wait_with(&token, None).await?;
                let mut stops = Vec::new();
                if let Some(trigger) = &trigger {
                    stops.push(trigger.complete().await?);
                }
                stops.push(detector.complete().await?);
                for ch in &channels {
                    stops.push(ch.complete().await?);
                }
                Status::all("devices_stopped", stops)
                    .wait_with(&token, None)
                    .await
            },
        ));

        if let Some(aux) = &self.aux {
            let mut capture = inner
                .aux_capture
                .take()
                .unwrap_or_else(|| aux.capture_signal().monitor());
            let aux = aux.clone();
            let token = scan.clone();
            statuses.push(Status::spawn(
                format!("{}_capture", aux.name()),
                async move {
                    wait_for_edge(&mut capture, Edge::Falling, &token).await?;
                    aux.complete().await?.wait_with(&token, None).await
                },
            ));
        }

        let combined = Status::all(format!("{}_complete", self.name), statuses);
        let status = match self.complete_timeout {
            Some(limit) => {
                let combined = combined.clone();
                Status::spawn(format!("{}_complete_bounded", self.name), async move {
                    combined.wait_with(&scan, Some(limit)).await
                })
            }
            None => combined,
        };
        inner.state = next;
        debug!(device = %self.name, "Complete requested");
        Ok(status)
    }

    async fn describe_collect(&self) -> DescribeCollect {
        let mut describe = self.detector.describe_collect().await;
        for ch in &self.channels {
            merge_describe(&mut describe, ch.describe_collect().await);
        }
        if let Some(trigger) = &self.trigger {
            merge_describe(&mut describe, trigger.describe_collect().await);
        }
        if let Some(aux) = &self.aux {
            merge_describe(&mut describe, aux.describe_collect().await);
        }
        describe
    }

    /// Release the hardware, then chain every constituent's points.
    async fn collect(&self) -> AppResult<Vec<CollectPoint>> {
        let mut inner = self.inner.lock().await;
        let state = inner.state;
        let next = state
            .next(FlyEvent::Collect)
            .ok_or_else(|| self.sequence_fault(state, FlyEvent::Collect))?;
        self.unstage_all().await?;

        let mut points = Vec::new();
        for ch in &self.channels {
            points.extend(ch.collect().await?);
        }
        points.extend(self.detector.collect().await?);
        if let Some(trigger) = &self.trigger {
            points.extend(trigger.collect().await?);
        }
        if let Some(aux) = &self.aux {
            points.extend(aux.collect().await?);
        }
        if let Some(scan) = inner.scan.take() {
            scan.cancel();
        }
        inner.state = next;
        info!(device = %self.name, points = points.len(), "Collected");
        Ok(points)
    }

    async fn collect_asset_docs(&self) -> Vec<AssetDoc> {
        let mut docs = self.detector.collect_asset_docs().await;
        for ch in &self.channels {
            docs.extend(ch.collect_asset_docs().await);
        }
        if let Some(trigger) = &self.trigger {
            docs.extend(trigger.collect_asset_docs().await);
        }
        if let Some(aux) = &self.aux {
            docs.extend(aux.collect_asset_docs().await);
        }
        docs
    }
}
