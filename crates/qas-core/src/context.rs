//! Beamline context.
//!
//! One [`BeamlineContext`] is built at startup and passed by reference to
//! every device, flyer and plan. It carries the settings, the scan metadata
//! store and the root cancellation token; nothing is looked up through
//! process-wide globals.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::AppResult;

/// Persistent scan metadata (proposal, cycle, SAF, ...).
pub trait MetadataStore: Send + Sync {
    /// Value for `key`.
    fn get(&self, key: &str) -> Option<Value>;

    /// Store `value` under `key`.
    fn set(&self, key: &str, value: Value) -> AppResult<()>;

    /// Copy of every entry.
    fn snapshot(&self) -> BTreeMap<String, Value>;
}

/// Metadata held in memory only.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> AppResult<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.read().clone()
    }
}

/// Metadata persisted to a JSON file on every write.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Open `path`, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        } else {
            BTreeMap::new()
        };
        info!(path = %path.display(), "Opened metadata store");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, Value>) -> AppResult<()> {
        let text = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.path, text)?;
        debug!(path = %self.path.display(), "Metadata flushed");
        Ok(())
    }
}

impl MetadataStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> AppResult<()> {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }

    fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.read().clone()
    }
}

/// Everything a device needs from its surroundings.
#[derive(Clone)]
pub struct BeamlineContext {
    settings: Arc<Settings>,
    metadata: Arc<dyn MetadataStore>,
    cancel: CancellationToken,
}

impl BeamlineContext {
    /// Context with in-memory metadata.
    pub fn new(settings: Settings) -> Self {
        Self::with_metadata(settings, Arc::new(MemoryStore::new()))
    }

    /// Context with the given metadata store.
    pub fn with_metadata(settings: Settings, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            settings: Arc::new(settings),
            metadata,
            cancel: CancellationToken::new(),
        }
    }

    /// Settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Metadata store.
    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Root cancellation token; cancelled on shutdown.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every wait derived from this context.
    pub fn shutdown(&self) {
        info!("Beamline context shutting down");
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for BeamlineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeamlineContext")
            .field("settings", &self.settings)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
