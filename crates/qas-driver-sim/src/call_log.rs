//! Ordered record of register traffic.
//!
//! Every simulated register reports client puts, IOC-side updates and
//! monitor registrations to a shared [`CallLog`], so tests can assert the
//! order in which a flyer touched the hardware.

use parking_lot::Mutex;
use qas_core::signal::{PvValue, SignalObserver};

/// What happened to a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Client write
    Put,
    /// IOC-side value change
    Update,
    /// Monitor registered
    Monitor,
}

/// One logged call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEntry {
    /// Kind of call
    pub kind: CallKind,
    /// Register name
    pub signal: String,
    /// Value written, absent for monitors
    pub value: Option<PvValue>,
}

/// Shared call log.
#[derive(Debug, Default)]
pub struct CallLog {
    entries: Mutex<Vec<CallEntry>>,
}

impl CallLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry so far.
    pub fn entries(&self) -> Vec<CallEntry> {
        self.entries.lock().clone()
    }

    /// Forget everything logged so far.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn record(&self, kind: CallKind, signal: &str, value: Option<&PvValue>) {
        self.entries.lock().push(CallEntry {
            kind,
            signal: signal.to_string(),
            value: value.cloned(),
        });
    }

    /// Index of the first entry matching `pred`.
    pub fn position(&self, pred: impl Fn(&CallEntry) -> bool) -> Option<usize> {
        self.entries.lock().iter().position(pred)
    }

    /// Index of the first put of `value` to `signal`.
    pub fn first_put(&self, signal: &str, value: impl Into<PvValue>) -> Option<usize> {
        let value = value.into();
        self.position(|e| {
            e.kind == CallKind::Put && e.signal == signal && e.value.as_ref() == Some(&value)
        })
    }

    /// Index of the first put of any value to `signal`.
    pub fn first_put_to(&self, signal: &str) -> Option<usize> {
        self.position(|e| e.kind == CallKind::Put && e.signal == signal)
    }

    /// Index of the last put of `value` to `signal`.
    pub fn last_put(&self, signal: &str, value: impl Into<PvValue>) -> Option<usize> {
        let value = value.into();
        self.entries.lock().iter().rposition(|e| {
            e.kind == CallKind::Put && e.signal == signal && e.value.as_ref() == Some(&value)
        })
    }

    /// Index of the first monitor registered on `signal`.
    pub fn first_monitor(&self, signal: &str) -> Option<usize> {
        self.position(|e| e.kind == CallKind::Monitor && e.signal == signal)
    }

    /// Values put to `signal`, in order.
    pub fn puts_to(&self, signal: &str) -> Vec<PvValue> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.kind == CallKind::Put && e.signal == signal)
            .filter_map(|e| e.value.clone())
            .collect()
    }

    /// Number of puts to registers whose name starts with `prefix`.
    pub fn put_count(&self, prefix: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.kind == CallKind::Put && e.signal.starts_with(prefix))
            .count()
    }
}

impl SignalObserver for CallLog {
    fn on_put(&self, signal: &str, value: &PvValue) {
        self.record(CallKind::Put, signal, Some(value));
    }

    fn on_update(&self, signal: &str, value: &PvValue) {
        self.record(CallKind::Update, signal, Some(value));
    }

    fn on_monitor(&self, signal: &str) {
        self.record(CallKind::Monitor, signal, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qas_core::signal::{LocalSignal, Signal};
    use std::sync::Arc;

    #[tokio::test]
    async fn entries_keep_call_order() {
        let log = Arc::new(CallLog::new());
        let sig = LocalSignal::new("XF:TEST-Stream", 0).with_observer(log.clone());
        let _monitor = sig.monitor();
        sig.put(1.into()).await.unwrap();
        sig.set(0);

        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, CallKind::Monitor);
        assert_eq!(log.first_put("XF:TEST-Stream", 1), Some(1));
        assert_eq!(entries[2].kind, CallKind::Update);
        assert_eq!(log.puts_to("XF:TEST-Stream"), vec![PvValue::Int(1)]);
        assert_eq!(log.put_count("XF:TEST"), 1);
    }
}
