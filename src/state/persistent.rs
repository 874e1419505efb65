//! Keyed state mirrored into a storage backend.
//!
//! The whole snapshot is stored as one JSON blob under one key. Loading
//! merges only known, non-excluded leaves over the current values; saving
//! writes every leaf except the excluded ones.

use crate::state::keyed::{leaves, Change, KeyedState, StateError, Subscription};
use crate::state::storage::{StorageBackend, StorageError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

fn remove_path(root: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut node = root;
    for segment in parents {
        match node.as_object_mut().and_then(|m| m.get_mut(*segment)) {
            Some(child) => node = child,
            None => return,
        }
    }
    if let Some(map) = node.as_object_mut() {
        map.remove(*last);
    }
}

/// Keyed state persisted under a single storage key.
pub struct PersistentState {
    state: Arc<KeyedState>,
    storage: Arc<dyn StorageBackend>,
    key: String,
    exclude: Vec<String>,
}

impl PersistentState {
    /// Creates a persistent state over `defaults`, stored under `key`.
    pub fn new(
        key: impl Into<String>,
        defaults: Value,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self, StateError> {
        Ok(Self {
            state: Arc::new(KeyedState::new(defaults)?),
            storage,
            key: key.into(),
            exclude: Vec::new(),
        })
    }

    /// Paths kept in memory but never written to or read from storage.
    pub fn with_exclude<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Storage key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Underlying in-memory state.
    pub fn state(&self) -> &Arc<KeyedState> {
        &self.state
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.exclude
            .iter()
            .any(|ex| path == ex || path.starts_with(&format!("{}.", ex)))
    }

    /// Loads the stored blob and merges it over the current values.
    ///
    /// A missing blob is the first run and leaves the defaults in place. A
    /// corrupt blob or a failing backend is logged and ignored.
    pub async fn init(&self) {
        let blob = match self.storage.get_item(&self.key).await {
            Ok(Some(blob)) if !blob.trim().is_empty() => blob,
            Ok(_) => {
                debug!("No stored state for {}", self.key);
                return;
            }
            Err(e) => {
                warn!("[PersistentState:init] {}: {}", self.key, e);
                return;
            }
        };

        let stored: Value = match serde_json::from_str(&blob) {
            Ok(value) => value,
            Err(e) => {
                warn!("[PersistentState:init] Corrupt blob under {}: {}", self.key, e);
                return;
            }
        };

        let mut pairs = Vec::new();
        leaves("", &stored, &mut pairs);
        let mut merged = 0usize;
        for (path, value) in pairs {
            if self.is_excluded(&path) || !self.state.is_known(&path) {
                continue;
            }
            match self.state.set(&path, value) {
                Ok(_) => merged += 1,
                Err(e) => warn!("[PersistentState:init] {}.{}: {}", self.key, path, e),
            }
        }
        debug!("Loaded {} stored values for {}", merged, self.key);
    }

    /// Full snapshot.
    pub fn get(&self) -> Value {
        self.state.get()
    }

    /// Value at a path.
    pub fn get_path(&self, path: &str) -> Option<Value> {
        self.state.get_path(path)
    }

    /// Boolean at a path.
    pub fn get_bool(&self, path: &str) -> bool {
        self.state.get_bool(path)
    }

    /// Snapshot deserialised into `T`.
    pub fn snapshot_as<T: DeserializeOwned>(&self) -> Result<T, StateError> {
        Ok(serde_json::from_value(self.state.get())?)
    }

    /// Adds a default for `path`.
    pub fn define(&self, path: &str, default: Value) -> Result<(), StateError> {
        self.state.define(path, default)
    }

    /// Writes `value` at `path` and persists the snapshot when anything changed.
    pub async fn set(&self, path: &str, value: Value) -> Result<bool, StateError> {
        let changed = self.state.set(path, value)?;
        if changed {
            self.save().await;
        }
        Ok(changed)
    }

    /// Writes every leaf of `partial` and persists the snapshot when anything changed.
    pub async fn set_partial(&self, partial: &Value) -> Result<Vec<String>, StateError> {
        let changed = self.state.set_partial(partial)?;
        if !changed.is_empty() {
            self.save().await;
        }
        Ok(changed)
    }

    /// Replaces the value at `path` with `updater(current)` and persists when it changed.
    pub async fn update<F>(&self, path: &str, updater: F) -> Result<bool, StateError>
    where
        F: FnOnce(Value) -> Value,
    {
        let changed = self.state.update(path, updater)?;
        if changed {
            self.save().await;
        }
        Ok(changed)
    }

    /// Restores constructor-time defaults and persists.
    pub async fn reset(&self, path: Option<&str>) -> Result<Vec<String>, StateError> {
        let changed = self.state.reset(path)?;
        if !changed.is_empty() {
            self.save().await;
        }
        Ok(changed)
    }

    /// Subscribes to changes of exactly `path`.
    pub fn subscribe<F>(&self, path: &str, listener: F, invoke_immediately: bool) -> Subscription
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.state.subscribe(path, listener, invoke_immediately)
    }

    /// Subscribes to changes of every path.
    pub fn subscribe_all<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.state.subscribe_all(listener)
    }

    /// Subscribes to the next change of `path` only.
    pub fn once<F>(&self, path: &str, listener: F) -> Subscription
    where
        F: FnOnce(&Change) + Send + 'static,
    {
        self.state.once(path, listener)
    }

    /// Snapshot with excluded paths removed.
    pub fn persisted_snapshot(&self) -> Value {
        let mut snapshot = self.state.get();
        for path in &self.exclude {
            remove_path(&mut snapshot, path);
        }
        snapshot
    }

    /// Writes the snapshot to storage, returning the backend error.
    pub async fn try_save(&self) -> Result<(), StorageError> {
        let blob = self.persisted_snapshot().to_string();
        self.storage.set_item(&self.key, &blob).await
    }

    /// Writes the snapshot to storage. Failures are logged; in-memory state stays changed.
    pub async fn save(&self) {
        if let Err(e) = self.try_save().await {
            warn!("[PersistentState:save] {}: {}", self.key, e);
        }
    }
}

impl fmt::Debug for PersistentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentState")
            .field("key", &self.key)
            .field("exclude", &self.exclude)
            .field("state", &self.state)
            .finish()
    }
}
