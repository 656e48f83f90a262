//! Asynchronous completion handles.
//!
//! A [`Status`] is returned by `kickoff()` and `complete()`. It starts pending
//! and resolves exactly once, either successfully or with a [`StatusError`].
//! Clones share the same outcome, callbacks registered after resolution run
//! immediately, and two statuses can be combined with [`Status::and`].
//!
//! [`SubscriptionStatus`] resolves a status from hardware updates: it watches
//! a [`SignalMonitor`] and finishes on the first change that satisfies a
//! predicate. Every wait honours a [`CancellationToken`], so an aborted scan
//! fails its statuses instead of leaving them pending forever.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StatusError;
use crate::signal::{Edge, SignalMonitor, ValueChange};

/// Outcome of a resolved status.
pub type StatusOutcome = Result<(), StatusError>;

type Callback = Box<dyn FnOnce(&StatusOutcome) + Send>;

struct StatusInner {
    name: String,
    outcome: watch::Sender<Option<StatusOutcome>>,
    callbacks: Mutex<Vec<Callback>>,
}

/// Shared asynchronous completion handle.
#[derive(Clone)]
pub struct Status {
    inner: Arc<StatusInner>,
}

impl Status {
    /// Pending status.
    pub fn new(name: impl Into<String>) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(StatusInner {
                name: name.into(),
                outcome,
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Status that is already finished successfully.
    pub fn done(name: impl Into<String>) -> Self {
        let status = Self::new(name);
        status.finish();
        status
    }

    /// Status that is already failed.
    pub fn failed(name: impl Into<String>, err: StatusError) -> Self {
        let status = Self::new(name);
        status.fail(err);
        status
    }

    /// Status resolved by the outcome of `fut`, which runs on its own task.
    pub fn spawn<F>(name: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = StatusOutcome> + Send + 'static,
    {
        let status = Self::new(name);
        let handle = status.clone();
        tokio::spawn(async move {
            let outcome = fut.await;
            handle.resolve(outcome);
        });
        status
    }

    /// Resolve every status in `statuses` into one conjunction.
    pub fn all(name: impl Into<String>, statuses: impl IntoIterator<Item = Status>) -> Self {
        let statuses: Vec<Status> = statuses.into_iter().collect();
        let combined = Self::new(name);
        if statuses.is_empty() {
            combined.finish();
            return combined;
        }
        let remaining = Arc::new(Mutex::new(statuses.len()));
        for status in &statuses {
            let combined = combined.clone();
            let remaining = remaining.clone();
            status.add_callback(move |outcome| match outcome {
                Err(err) => {
                    combined.fail(err.clone());
                }
                Ok(()) => {
                    let mut left = remaining.lock();
                    *left -= 1;
                    if *left == 0 {
                        drop(left);
                        combined.finish();
                    }
                }
            });
        }
        combined
    }

    /// Conjunction: resolves when both resolve, fails on the first failure.
    pub fn and(&self, other: &Status) -> Status {
        Status::all(
            format!("{} & {}", self.name(), other.name()),
            [self.clone(), other.clone()],
        )
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark finished. Returns false if the status was already resolved.
    pub fn finish(&self) -> bool {
        self.resolve(Ok(()))
    }

    /// Mark failed. Returns false if the status was already resolved.
    pub fn fail(&self, err: StatusError) -> bool {
        self.resolve(Err(err))
    }

    /// Resolve with `outcome`; the first resolution wins.
    pub fn resolve(&self, outcome: StatusOutcome) -> bool {
        let callbacks = {
            let mut callbacks = self.inner.callbacks.lock();
            if self.inner.outcome.borrow().is_some() {
                return false;
            }
            self.inner.outcome.send_replace(Some(outcome.clone()));
            std::mem::take(&mut *callbacks)
        };
        match &outcome {
            Ok(()) => debug!(status = %self.inner.name, "Status finished"),
            Err(err) => warn!(status = %self.inner.name, error = %err, "Status failed"),
        }
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }

    /// Whether the status has resolved.
    pub fn is_done(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    /// Whether the status resolved successfully.
    pub fn success(&self) -> bool {
        matches!(*self.inner.outcome.borrow(), Some(Ok(())))
    }

    /// Outcome, if resolved.
    pub fn outcome(&self) -> Option<StatusOutcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Run `callback` once the status resolves (immediately if it already has).
    pub fn add_callback(&self, callback: impl FnOnce(&StatusOutcome) + Send + 'static) {
        let resolved = {
            let mut callbacks = self.inner.callbacks.lock();
            let resolved = self.inner.outcome.borrow().clone();
            if resolved.is_none() {
                callbacks.push(Box::new(callback));
                return;
            }
            resolved
        };
        if let Some(outcome) = resolved {
            callback(&outcome);
        }
    }

    /// Wait for resolution.
    pub async fn wait(&self) -> StatusOutcome {
        let mut rx = self.inner.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
            // The sender lives in `inner`, which `self` keeps alive.
            Err(_) => Err(StatusError::Cancelled),
        };
        outcome
    }

    /// Wait for resolution, giving up on cancellation or after `timeout`.
    pub async fn wait_with(
        &self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> StatusOutcome {
        let wait = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, self.wait())
                    .await
                    .unwrap_or(Err(StatusError::Timeout(limit))),
                None => self.wait().await,
            }
        };
        tokio::select! {
            outcome = wait => outcome,
            _ = cancel.cancelled() => Err(StatusError::Cancelled),
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("name", &self.inner.name)
            .field("outcome", &*self.inner.outcome.borrow())
            .finish()
    }
}

/// Wait on `monitor` until `predicate` accepts a change.
///
/// Fails with `Cancelled` when `cancel` fires, with `Lagged` when updates
/// were dropped (the awaited one may be among them) and with `Failed` when
/// the signal goes away or the predicate reports an error.
pub async fn wait_for_change<P>(
    monitor: &mut SignalMonitor,
    cancel: &CancellationToken,
    mut predicate: P,
) -> Result<ValueChange, StatusError>
where
    P: FnMut(&ValueChange) -> Result<bool, StatusError>,
{
    loop {
        let change = tokio::select! {
            change = monitor.recv() => change?,
            _ = cancel.cancelled() => return Err(StatusError::Cancelled),
        };
        let Some(change) = change else {
            return Err(StatusError::Failed(format!(
                "monitor on '{}' closed",
                monitor.signal()
            )));
        };
        if predicate(&change)? {
            return Ok(change);
        }
    }
}

/// Wait on `monitor` for one `edge`.
pub async fn wait_for_edge(
    monitor: &mut SignalMonitor,
    edge: Edge,
    cancel: &CancellationToken,
) -> Result<ValueChange, StatusError> {
    wait_for_change(monitor, cancel, |change| Ok(edge.matches(change))).await
}

/// Builder for statuses resolved by signal updates.
pub struct SubscriptionStatus {
    name: String,
    monitor: SignalMonitor,
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl SubscriptionStatus {
    /// Watch `monitor`; the monitor must be created before the action that
    /// causes the awaited update.
    pub fn new(name: impl Into<String>, monitor: SignalMonitor) -> Self {
        Self {
            name: name.into(),
            monitor,
            cancel: CancellationToken::new(),
            timeout: None,
        }
    }

    /// Fail the status when `cancel` fires.
    pub fn cancel_on(mut self, cancel: &CancellationToken) -> Self {
        self.cancel = cancel.clone();
        self
    }

    /// Fail the status if nothing matches within `timeout`.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve on the first change for which `predicate` returns true.
    pub fn spawn<P>(self, predicate: P) -> Status
    where
        P: FnMut(&ValueChange) -> Result<bool, StatusError> + Send + 'static,
    {
        let Self {
            name,
            mut monitor,
            cancel,
            timeout,
        } = self;
        Status::spawn(name, async move {
            let wait = wait_for_change(&mut monitor, &cancel, predicate);
            match timeout {
                Some(limit) => tokio::time::timeout(limit, wait)
                    .await
                    .unwrap_or(Err(StatusError::Timeout(limit)))
                    .map(|_| ()),
                None => wait.await.map(|_| ()),
            }
        })
    }

    /// Resolve on the first `edge`.
    pub fn edge(self, edge: Edge) -> Status {
        self.spawn(move |change| Ok(edge.matches(change)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{LocalSignal, Signal};

    #[tokio::test]
    async fn callbacks_run_once_even_when_added_late() {
        let status = Status::new("late");
        let hits = Arc::new(Mutex::new(0));
        let early = hits.clone();
        status.add_callback(move |_| *early.lock() += 1);
        assert!(status.finish());
        assert!(!status.fail(StatusError::Cancelled));
        let late = hits.clone();
        status.add_callback(move |_| *late.lock() += 1);
        assert_eq!(*hits.lock(), 2);
        assert!(status.success());
    }

    #[tokio::test]
    async fn conjunction_waits_for_both_sides() {
        let a = Status::new("a");
        let b = Status::new("b");
        let both = a.and(&b);
        a.finish();
        assert!(!both.is_done());
        b.finish();
        assert_eq!(both.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn conjunction_fails_on_first_failure() {
        let a = Status::new("a");
        let b = Status::new("b");
        let both = a.and(&b);
        b.fail(StatusError::Failed("file never saved".into()));
        assert!(both.is_done());
        assert!(!both.success());
        assert!(Status::all("none", []).success());
    }

    #[tokio::test]
    async fn subscription_resolves_on_matching_edge() {
        let sig = LocalSignal::new("XF:TEST-Streaming-I", 0);
        let status = SubscriptionStatus::new("streaming", sig.monitor()).edge(Edge::Falling);
        sig.put(1.into()).await.unwrap();
        sig.put(0.into()).await.unwrap();
        assert_eq!(status.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn cancelled_subscription_fails_instead_of_hanging() {
        let sig = LocalSignal::new("XF:TEST-File:Status-I", 0);
        let cancel = CancellationToken::new();
        let status = SubscriptionStatus::new("file", sig.monitor())
            .cancel_on(&cancel)
            .edge(Edge::Rising);
        cancel.cancel();
        assert_eq!(status.wait().await, Err(StatusError::Cancelled));
    }

    #[tokio::test]
    async fn dropped_updates_fail_the_wait() {
        let sig = LocalSignal::new("XF:TEST-Streaming-I", 0);
        let mut monitor = sig.monitor();
        for i in 0..300 {
            sig.set(i % 2);
        }
        let outcome = wait_for_edge(&mut monitor, Edge::Falling, &CancellationToken::new()).await;
        assert!(
            matches!(outcome, Err(StatusError::Lagged { ref signal, .. }) if signal == "XF:TEST-Streaming-I"),
            "{outcome:?}"
        );
        // The monitor catches up and keeps working.
        sig.set(1);
        sig.set(0);
        let change = wait_for_edge(&mut monitor, Edge::Falling, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(change.new, 0.into());
    }

    #[tokio::test]
    async fn subscription_timeout_is_bounded() {
        let sig = LocalSignal::new("XF:TEST-Capture", 1);
        let status = SubscriptionStatus::new("capture", sig.monitor())
            .timeout(Some(Duration::from_millis(20)))
            .edge(Edge::Falling);
        assert_eq!(
            status.wait().await,
            Err(StatusError::Timeout(Duration::from_millis(20)))
        );
    }

    #[tokio::test]
    async fn wait_with_observes_cancellation() {
        let status = Status::new("never");
        let cancel = CancellationToken::new();
        let waiter = {
            let status = status.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { status.wait_with(&cancel, None).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Err(StatusError::Cancelled));
        assert!(!status.is_done());
    }

    #[test]
    fn pending_status_is_pending_under_tokio_test() {
        let status = Status::new("pending");
        let mut wait = tokio_test::task::spawn(status.wait());
        tokio_test::assert_pending!(wait.poll());
        status.finish();
        assert!(wait.is_woken());
        tokio_test::assert_ready_eq!(wait.poll(), Ok(()));
    }
}
