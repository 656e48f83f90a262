//! Remote process variables.
//!
//! Every hardware register a QAS device touches is a [`Signal`]: it can be
//! read, written and monitored. Monitors deliver `(old, new)` pairs for every
//! update after the monitor was created, so a subscription set up before a
//! put never misses the edge the put causes.
//!
//! [`LocalSignal`] is the in-process implementation, built on
//! `tokio::sync::watch` for the current value and `tokio::sync::broadcast`
//! for the change stream. It backs the simulated IOCs and the tests; a
//! Channel-Access binding would implement the same trait.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::document::now_secs;
use crate::error::{AppResult, FlyerError, StatusError};

/// Capacity of the per-signal change stream.
const MONITOR_CAPACITY: usize = 256;

/// A process variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PvValue {
    /// Integer or enum register
    Int(i64),
    /// Floating point register
    Float(f64),
    /// String / waveform-of-char register
    Text(String),
}

impl PvValue {
    /// Integer view with `round()` semantics, used by edge detection.
    pub fn as_rounded(&self) -> Option<i64> {
        match self {
            PvValue::Int(v) => Some(*v),
            PvValue::Float(v) if v.is_finite() => Some(v.round() as i64),
            PvValue::Float(_) => None,
            PvValue::Text(s) => s.trim().parse::<f64>().ok().map(|v| v.round() as i64),
        }
    }

    /// Floating point view.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Int(v) => Some(*v as f64),
            PvValue::Float(v) => Some(*v),
            PvValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// String view.
    pub fn as_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Int(v) => write!(f, "{v}"),
            PvValue::Float(v) => write!(f, "{v}"),
            PvValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for PvValue {
    fn from(v: i64) -> Self {
        PvValue::Int(v)
    }
}

impl From<i32> for PvValue {
    fn from(v: i32) -> Self {
        PvValue::Int(i64::from(v))
    }
}

impl From<u64> for PvValue {
    fn from(v: u64) -> Self {
        PvValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for PvValue {
    fn from(v: f64) -> Self {
        PvValue::Float(v)
    }
}

impl From<&str> for PvValue {
    fn from(v: &str) -> Self {
        PvValue::Text(v.to_string())
    }
}

impl From<String> for PvValue {
    fn from(v: String) -> Self {
        PvValue::Text(v)
    }
}

/// One monitor update.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    /// Value before the update
    pub old: PvValue,
    /// Value after the update
    pub new: PvValue,
    /// Wall-clock time of the update in seconds since the epoch
    pub timestamp: f64,
}

impl ValueChange {
    /// `old == from && new == to` after rounding both sides.
    pub fn is_transition(&self, from: i64, to: i64) -> bool {
        self.old.as_rounded() == Some(from) && self.new.as_rounded() == Some(to)
    }
}

/// Direction of a binary status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// 0 -> 1
    Rising,
    /// 1 -> 0
    Falling,
}

impl Edge {
    /// Whether `change` is this edge.
    pub fn matches(self, change: &ValueChange) -> bool {
        match self {
            Edge::Rising => change.is_transition(0, 1),
            Edge::Falling => change.is_transition(1, 0),
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Rising => f.write_str("0->1"),
            Edge::Falling => f.write_str("1->0"),
        }
    }
}

/// Receiving end of a signal subscription.
pub struct SignalMonitor {
    signal: String,
    rx: broadcast::Receiver<ValueChange>,
}

impl SignalMonitor {
    /// Wrap a broadcast receiver.
    pub fn new(signal: impl Into<String>, rx: broadcast::Receiver<ValueChange>) -> Self {
        Self {
            signal: signal.into(),
            rx,
        }
    }

    /// Name of the monitored signal.
    pub fn signal(&self) -> &str {
        &self.signal
    }

    /// Next update, or `None` once the signal is gone.
    ///
    /// Fails with [`StatusError::Lagged`] when updates were dropped because
    /// the monitor fell behind; the monitor stays usable afterwards.
    pub async fn recv(&mut self) -> Result<Option<ValueChange>, StatusError> {
        match self.rx.recv().await {
            Ok(change) => Ok(Some(change)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(signal = %self.signal, skipped, "Monitor lagged, updates dropped");
                Err(StatusError::Lagged {
                    signal: self.signal.clone(),
                    skipped,
                })
            }
            Err(broadcast::error::RecvError::Closed) => Ok(None),
        }
    }

    /// Next update, skipping over lag; `None` once the signal is gone.
    pub async fn next(&mut self) -> Option<ValueChange> {
        loop {
            match self.recv().await {
                Ok(change) => return change,
                Err(_) => continue,
            }
        }
    }
}

impl fmt::Debug for SignalMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalMonitor")
            .field("signal", &self.signal)
            .finish()
    }
}

/// A remote register with get/put/subscribe.
#[async_trait]
pub trait Signal: Send + Sync {
    /// Process variable name.
    fn name(&self) -> &str;

    /// Whether the underlying connection is up.
    fn connected(&self) -> bool;

    /// Read the current value.
    async fn get(&self) -> AppResult<PvValue>;

    /// Write a value.
    async fn put(&self, value: PvValue) -> AppResult<()>;

    /// Subscribe to every update from now on.
    fn monitor(&self) -> SignalMonitor;
}

/// Shared handle to a signal.
pub type SignalRef = Arc<dyn Signal>;

/// Receives every put and simulated update on observed signals, in order.
pub trait SignalObserver: Send + Sync {
    /// A client wrote `value` to `signal`.
    fn on_put(&self, signal: &str, value: &PvValue);

    /// The value of `signal` changed without a client put (IOC side update).
    fn on_update(&self, _signal: &str, _value: &PvValue) {}

    /// A monitor was registered on `signal`.
    fn on_monitor(&self, _signal: &str) {}
}

/// In-process signal.
pub struct LocalSignal {
    name: String,
    value: watch::Sender<PvValue>,
    changes: broadcast::Sender<ValueChange>,
    connected: Mutex<bool>,
    read_only: bool,
    observer: Option<Arc<dyn SignalObserver>>,
}

impl LocalSignal {
    /// Writable signal with an initial value.
    pub fn new(name: impl Into<String>, initial: impl Into<PvValue>) -> Self {
        let (value, _) = watch::channel(initial.into());
        let (changes, _) = broadcast::channel(MONITOR_CAPACITY);
        Self {
            name: name.into(),
            value,
            changes,
            connected: Mutex::new(true),
            read_only: false,
            observer: None,
        }
    }

    /// Readback signal that rejects client puts.
    pub fn read_only(name: impl Into<String>, initial: impl Into<PvValue>) -> Self {
        Self {
            read_only: true,
            ..Self::new(name, initial)
        }
    }

    /// Report puts and updates to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn SignalObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Simulate a connection loss or recovery.
    pub fn set_connected(&self, connected: bool) {
        *self.connected.lock() = connected;
    }

    /// Current value without going through the async interface.
    pub fn value(&self) -> PvValue {
        self.value.borrow().clone()
    }

    /// IOC-side update: changes the value and notifies monitors.
    pub fn set(&self, value: impl Into<PvValue>) {
        let value = value.into();
        if let Some(observer) = &self.observer {
            observer.on_update(&self.name, &value);
        }
        self.apply(value);
    }

    fn apply(&self, new: PvValue) {
        let old = self.value.send_replace(new.clone());
        debug!(signal = %self.name, %old, %new, "Signal updated");
        // No receivers is fine, nobody is monitoring.
        let _ = self.changes.send(ValueChange {
            old,
            new,
            timestamp: now_secs(),
        });
    }
}

impl fmt::Debug for LocalSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSignal")
            .field("name", &self.name)
            .field("value", &*self.value.borrow())
            .finish()
    }
}

#[async_trait]
impl Signal for LocalSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn connected(&self) -> bool {
        *self.connected.lock()
    }

    async fn get(&self) -> AppResult<PvValue> {
        if !self.connected() {
            return Err(FlyerError::NotConnected {
                device: self.name.clone(),
            });
        }
        Ok(self.value())
    }

    async fn put(&self, value: PvValue) -> AppResult<()> {
        if !self.connected() {
            return Err(FlyerError::NotConnected {
                device: self.name.clone(),
            });
        }
        if self.read_only {
            return Err(FlyerError::signal(&self.name, "read-only signal"));
        }
        if let Some(observer) = &self.observer {
            observer.on_put(&self.name, &value);
        }
        self.apply(value);
        Ok(())
    }

    fn monitor(&self) -> SignalMonitor {
        if let Some(observer) = &self.observer {
            observer.on_monitor(&self.name);
        }
        SignalMonitor::new(&self.name, self.changes.subscribe())
    }
}

/// Read a signal as a float, failing on non-numeric values.
pub async fn get_f64(signal: &dyn Signal) -> AppResult<f64> {
    let value = signal.get().await?;
    value
        .as_f64()
        .ok_or_else(|| FlyerError::signal(signal.name(), format!("'{value}' is not numeric")))
}

/// Read a signal as a rounded integer, failing on non-numeric values.
pub async fn get_i64(signal: &dyn Signal) -> AppResult<i64> {
    let value = signal.get().await?;
    value
        .as_rounded()
        .ok_or_else(|| FlyerError::signal(signal.name(), format!("'{value}' is not numeric")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_matches_edge_detection() {
        assert_eq!(PvValue::Float(0.6).as_rounded(), Some(1));
        assert_eq!(PvValue::Text(" 1.0 ".into()).as_rounded(), Some(1));
        assert_eq!(PvValue::Text("Done".into()).as_rounded(), None);
        assert_eq!(PvValue::Float(f64::NAN).as_rounded(), None);
    }

    #[test]
    fn edges_require_both_sides() {
        let change = |old: i64, new: i64| ValueChange {
            old: old.into(),
            new: new.into(),
            timestamp: 0.0,
        };
        assert!(Edge::Rising.matches(&change(0, 1)));
        assert!(!Edge::Rising.matches(&change(1, 1)));
        assert!(!Edge::Rising.matches(&change(2, 1)));
        assert!(Edge::Falling.matches(&change(1, 0)));
        assert!(!Edge::Falling.matches(&change(0, 0)));
    }

    #[tokio::test]
    async fn monitor_sees_puts_made_after_subscribing() {
        let sig = LocalSignal::new("XF:TEST-Stream", 0);
        let mut monitor = sig.monitor();
        sig.put(1.into()).await.unwrap();
        let change = monitor.next().await.unwrap();
        assert!(Edge::Rising.matches(&change));
        assert_eq!(sig.get().await.unwrap(), PvValue::Int(1));
    }

    #[tokio::test]
    async fn read_only_and_disconnected_signals_reject_puts() {
        let rb = LocalSignal::read_only("XF:TEST-Streaming-I", 0);
        assert!(rb.put(1.into()).await.is_err());
        rb.set(1);
        assert_eq!(rb.value(), PvValue::Int(1));

        let sp = LocalSignal::new("XF:TEST-Sel", 1);
        sp.set_connected(false);
        assert!(matches!(
            sp.put(0.into()).await,
            Err(FlyerError::NotConnected { .. })
        ));
        assert!(get_i64(&sp).await.is_err());
    }
}
