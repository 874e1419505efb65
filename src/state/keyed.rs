//! Observable keyed state.
//!
//! A JSON object tree addressed by dot-separated paths (`"group.feature"`).
//! Writes compare old and new values and notify the listeners subscribed to
//! exactly that path, then the listeners subscribed to every path. Writing an
//! object is decomposed into its leaves, so every changed leaf is notified
//! exactly once. A panicking listener is logged and skipped.

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{error, trace};

/// Errors raised by state operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// Empty path or empty segment.
    #[error("Invalid state path: {0:?}")]
    InvalidPath(String),

    /// A path segment runs through a non-object value.
    #[error("State path {path} runs through a non-object value")]
    NotAnObject {
        /// Offending path.
        path: String,
    },

    /// The path has no default.
    #[error("Unknown state path: {0}")]
    UnknownPath(String),

    /// The defaults are not a JSON object.
    #[error("State defaults must be a JSON object")]
    DefaultsNotObject,

    /// The snapshot does not deserialize into the requested type.
    #[error("Failed to deserialize state: {0}")]
    Deserialize(#[from] serde_json::Error),
}

/// A change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Changed path.
    pub path: String,
    /// New value.
    pub value: Value,
    /// Previous value, `Null` if there was none.
    pub old_value: Value,
}

type ListenerFn = Arc<dyn Fn(&Change) + Send + Sync>;
type ListenerMap = HashMap<String, Vec<(u64, ListenerFn)>>;

/// Listener key of all-path subscriptions. Never a valid state path.
const ALL_PATHS: &str = "";

fn remove_listener(listeners: &Weak<RwLock<ListenerMap>>, path: &str, id: u64) {
    if let Some(listeners) = listeners.upgrade() {
        if let Some(list) = listeners.write().get_mut(path) {
            list.retain(|(existing, _)| *existing != id);
        }
    }
}

/// Handle of a subscription.
#[must_use = "dropping a Subscription keeps the listener subscribed"]
pub struct Subscription {
    id: u64,
    path: String,
    listeners: Weak<RwLock<ListenerMap>>,
}

impl Subscription {
    /// Subscribed path, empty for an all-path subscription.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Removes the listener.
    pub fn unsubscribe(self) {
        remove_listener(&self.listeners, &self.path, self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

fn split_path(path: &str) -> Result<Vec<&str>, StateError> {
    let segments: Vec<&str> = path.split('.').collect();
    if path.is_empty() || segments.iter().any(|s| s.is_empty()) {
        return Err(StateError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |node, segment| node.as_object()?.get(*segment))
}

/// Leaf paths and values of an object, depth-first in key order.
pub(crate) fn leaves(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                leaves(&path, child, out);
            }
        }
        other => {
            if !prefix.is_empty() {
                out.push((prefix.to_string(), other.clone()));
            }
        }
    }
}

/// Writes `value` at `segments`, creating intermediate objects.
/// Returns the previous value.
fn write(root: &mut Value, path: &str, segments: &[&str], value: Value) -> Result<Value, StateError> {
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| StateError::InvalidPath(path.to_string()))?;
    let mut node = root;
    for segment in parents {
        let map = node.as_object_mut().ok_or_else(|| StateError::NotAnObject {
            path: path.to_string(),
        })?;
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let map = node.as_object_mut().ok_or_else(|| StateError::NotAnObject {
        path: path.to_string(),
    })?;
    Ok(map.insert(last.to_string(), value).unwrap_or(Value::Null))
}

/// Observable state tree with constructor-time defaults.
pub struct KeyedState {
    defaults: RwLock<Value>,
    current: RwLock<Value>,
    listeners: Arc<RwLock<ListenerMap>>,
    next_id: AtomicU64,
}

impl KeyedState {
    /// Creates state initialised to `defaults`, which must be an object.
    pub fn new(defaults: Value) -> Result<Self, StateError> {
        if !defaults.is_object() {
            return Err(StateError::DefaultsNotObject);
        }
        Ok(Self {
            current: RwLock::new(defaults.clone()),
            defaults: RwLock::new(defaults),
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    /// Snapshot of the whole tree.
    pub fn get(&self) -> Value {
        self.current.read().clone()
    }

    /// Value at a path.
    pub fn get_path(&self, path: &str) -> Option<Value> {
        let segments = split_path(path).ok()?;
        lookup(&self.current.read(), &segments).cloned()
    }

    /// Boolean at a path, `false` if absent or not a boolean.
    pub fn get_bool(&self, path: &str) -> bool {
        self.get_path(path).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Adds a default for `path`, seeding the current tree when it has no value there.
    pub fn define(&self, path: &str, default: Value) -> Result<(), StateError> {
        let segments = split_path(path)?;
        write(&mut self.defaults.write(), path, &segments, default.clone())?;
        let mut current = self.current.write();
        if lookup(&current, &segments).is_none() {
            write(&mut current, path, &segments, default)?;
        }
        Ok(())
    }

    /// Leaf paths that have a default.
    pub fn known_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        leaves("", &self.defaults.read(), &mut out);
        out.into_iter().map(|(path, _)| path).collect()
    }

    /// Whether `path` is a known leaf path.
    pub fn is_known(&self, path: &str) -> bool {
        split_path(path)
            .ok()
            .and_then(|segments| lookup(&self.defaults.read(), &segments).cloned())
            .map(|value| !matches!(value, Value::Object(ref m) if !m.is_empty()))
            .unwrap_or(false)
    }

    /// Writes `value` at `path`. Returns whether anything changed.
    ///
    /// Objects are written leaf by leaf.
    pub fn set(&self, path: &str, value: Value) -> Result<bool, StateError> {
        split_path(path)?;
        let mut changes = Vec::new();
        if value.is_object() && !value.as_object().map(Map::is_empty).unwrap_or(true) {
            let mut pairs = Vec::new();
            leaves(path, &value, &mut pairs);
            for (leaf, leaf_value) in pairs {
                if let Some(change) = self.write_leaf(&leaf, leaf_value)? {
                    changes.push(change);
                }
            }
        } else if let Some(change) = self.write_leaf(path, value)? {
            changes.push(change);
        }

        let changed = !changes.is_empty();
        for change in changes {
            self.notify(&change);
        }
        Ok(changed)
    }

    /// Writes every leaf of `partial`. Returns the changed paths.
    pub fn set_partial(&self, partial: &Value) -> Result<Vec<String>, StateError> {
        let mut pairs = Vec::new();
        leaves("", partial, &mut pairs);
        let mut changes = Vec::new();
        for (path, value) in pairs {
            if let Some(change) = self.write_leaf(&path, value)? {
                changes.push(change);
            }
        }
        let paths = changes.iter().map(|c| c.path.clone()).collect();
        for change in changes {
            self.notify(&change);
        }
        Ok(paths)
    }

    /// Restores one path, or the whole tree, to the constructor-time defaults.
    ///
    /// Returns the changed paths.
    pub fn reset(&self, path: Option<&str>) -> Result<Vec<String>, StateError> {
        let defaults = self.defaults.read().clone();
        match path {
            None => self.set_partial(&defaults),
            Some(path) => {
                let segments = split_path(path)?;
                let default = lookup(&defaults, &segments)
                    .cloned()
                    .ok_or_else(|| StateError::UnknownPath(path.to_string()))?;
                let mut pairs = Vec::new();
                leaves(path, &default, &mut pairs);
                let mut partial = Value::Object(Map::new());
                for (leaf, value) in pairs {
                    let leaf_segments = split_path(&leaf)?;
                    write(&mut partial, &leaf, &leaf_segments, value)?;
                }
                self.set_partial(&partial)
            }
        }
    }

    /// Subscribes to changes of exactly `path`.
    ///
    /// With `invoke_immediately`, `listener` is called once right away with
    /// the current value as both `value` and `old_value`.
    pub fn subscribe<F>(&self, path: &str, listener: F, invoke_immediately: bool) -> Subscription
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let listener: ListenerFn = Arc::new(listener);
        let subscription = self.insert_listener(path, id, listener.clone());

        if invoke_immediately {
            let current = self.get_path(path).unwrap_or(Value::Null);
            call_listener(
                &listener,
                &Change {
                    path: path.to_string(),
                    value: current.clone(),
                    old_value: current,
                },
            );
        }
        subscription
    }

    /// Subscribes to changes of every path.
    pub fn subscribe_all<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.insert_listener(ALL_PATHS, id, Arc::new(listener))
    }

    /// Subscribes to the next change of `path` only.
    pub fn once<F>(&self, path: &str, listener: F) -> Subscription
    where
        F: FnOnce(&Change) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = Mutex::new(Some(listener));
        let listeners = Arc::downgrade(&self.listeners);
        let key = path.to_string();
        let wrapper: ListenerFn = Arc::new(move |change: &Change| {
            let Some(listener) = pending.lock().take() else {
                return;
            };
            remove_listener(&listeners, &key, id);
            listener(change);
        });
        self.insert_listener(path, id, wrapper)
    }

    /// Replaces the value at `path` with `updater(current)`, `Null` when unset.
    pub fn update<F>(&self, path: &str, updater: F) -> Result<bool, StateError>
    where
        F: FnOnce(Value) -> Value,
    {
        let current = self.get_path(path).unwrap_or(Value::Null);
        self.set(path, updater(current))
    }

    fn insert_listener(&self, path: &str, id: u64, listener: ListenerFn) -> Subscription {
        self.listeners
            .write()
            .entry(path.to_string())
            .or_default()
            .push((id, listener));
        Subscription {
            id,
            path: path.to_string(),
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn write_leaf(&self, path: &str, value: Value) -> Result<Option<Change>, StateError> {
        let segments = split_path(path)?;
        let mut current = self.current.write();
        if lookup(&current, &segments) == Some(&value) {
            return Ok(None);
        }
        let old_value = write(&mut current, path, &segments, value.clone())?;
        trace!("State {} = {}", path, value);
        Ok(Some(Change {
            path: path.to_string(),
            value,
            old_value,
        }))
    }

    fn notify(&self, change: &Change) {
        let listeners: Vec<ListenerFn> = {
            let map = self.listeners.read();
            let exact = map.get(&change.path).into_iter().flatten();
            let all = map.get(ALL_PATHS).into_iter().flatten();
            exact.chain(all).map(|(_, f)| f.clone()).collect()
        };
        for listener in listeners {
            call_listener(&listener, change);
        }
    }
}

fn call_listener(listener: &ListenerFn, change: &Change) {
    if catch_unwind(AssertUnwindSafe(|| listener(change))).is_err() {
        error!("[KeyedState:notify] {} listener panicked", change.path);
    }
}

impl fmt::Debug for KeyedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedState")
            .field("current", &*self.current.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn state() -> KeyedState {
        KeyedState::new(json!({
            "enabled": true,
            "learning-activity": {"forceAllowDownload": true, "playbackRate": false}
        }))
        .unwrap()
    }

    #[test]
    fn test_get_and_set_path() {
        let state = state();
        assert_eq!(state.get_path("learning-activity.playbackRate"), Some(json!(false)));
        assert!(state.set("learning-activity.playbackRate", json!(true)).unwrap());
        assert!(!state.set("learning-activity.playbackRate", json!(true)).unwrap());
        assert!(state.get_bool("learning-activity.playbackRate"));
        assert!(state.get_path("nope.x").is_none());
    }

    #[test]
    fn test_exact_path_listeners() {
        let state = state();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = state.subscribe(
            "learning-activity.playbackRate",
            move |change| sink.lock().push((change.value.clone(), change.old_value.clone())),
            true,
        );

        state.set("learning-activity.forceAllowDownload", json!(false)).unwrap();
        state.set("learning-activity.playbackRate", json!(true)).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![(json!(false), json!(false)), (json!(true), json!(false))]
        );
    }

    #[test]
    fn test_object_write_notifies_each_leaf_once() {
        let state = state();
        let hits = Arc::new(Mutex::new(Vec::new()));
        for path in ["learning-activity.forceAllowDownload", "learning-activity.playbackRate"] {
            let sink = hits.clone();
            let _ = state.subscribe(path, move |c| sink.lock().push(c.path.clone()), false);
        }

        let changed = state
            .set("learning-activity", json!({"forceAllowDownload": false, "playbackRate": true}))
            .unwrap();
        assert!(changed);
        assert_eq!(hits.lock().len(), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let state = state();
        let hits = Arc::new(Mutex::new(0));
        let sink = hits.clone();
        let sub = state.subscribe("enabled", move |_| *sink.lock() += 1, false);
        state.set("enabled", json!(false)).unwrap();
        sub.unsubscribe();
        state.set("enabled", json!(true)).unwrap();
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_reset_to_constructor_defaults() {
        let state = state();
        state.set("enabled", json!(false)).unwrap();
        state.set("learning-activity.playbackRate", json!(true)).unwrap();

        assert_eq!(state.reset(Some("enabled")).unwrap(), vec!["enabled"]);
        assert!(state.get_bool("learning-activity.playbackRate"));

        state.reset(None).unwrap();
        assert!(!state.get_bool("learning-activity.playbackRate"));
        assert!(matches!(state.reset(Some("missing")), Err(StateError::UnknownPath(_))));
    }

    #[test]
    fn test_define_and_known_paths() {
        let state = state();
        state.define("exam.mark.examMark", json!(true)).unwrap();
        state.define("enabled", json!(false)).unwrap();
        assert!(state.get_bool("exam.mark.examMark"));
        // Existing values are not overwritten by a new default.
        assert!(state.get_bool("enabled"));
        assert!(state.is_known("exam.mark.examMark"));
        assert!(!state.is_known("exam.mark"));
        assert!(state.known_paths().contains(&"learning-activity.playbackRate".to_string()));
    }

    #[test]
    fn test_invalid_paths() {
        let state = state();
        assert!(matches!(state.set("", json!(1)), Err(StateError::InvalidPath(_))));
        assert!(matches!(state.set("a..b", json!(1)), Err(StateError::InvalidPath(_))));
        assert!(matches!(
            state.set("enabled.deeper", json!(1)),
            Err(StateError::NotAnObject { .. })
        ));
    }

    #[test]
    fn test_panicking_listener_does_not_stop_siblings() {
        let state = state();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let _bad = state.subscribe(
            "learning-activity.forceAllowDownload",
            |_| panic!("listener failure"),
            false,
        );
        let sink = hits.clone();
        let _good = state.subscribe(
            "learning-activity.playbackRate",
            move |c| sink.lock().push(c.path.clone()),
            false,
        );

        let changed = state
            .set("learning-activity", json!({"forceAllowDownload": false, "playbackRate": true}))
            .unwrap();
        assert!(changed);
        assert_eq!(*hits.lock(), vec!["learning-activity.playbackRate"]);
        assert!(!state.get_bool("learning-activity.forceAllowDownload"));
    }

    #[test]
    fn test_subscribe_all_sees_every_leaf() {
        let state = state();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = state.subscribe_all(move |c| sink.lock().push(c.path.clone()));
        assert_eq!(sub.path(), "");

        state.set("enabled", json!(false)).unwrap();
        state.set("learning-activity.playbackRate", json!(true)).unwrap();
        state.set("enabled", json!(false)).unwrap();
        sub.unsubscribe();
        state.set("enabled", json!(true)).unwrap();

        assert_eq!(*seen.lock(), vec!["enabled", "learning-activity.playbackRate"]);
    }

    #[test]
    fn test_once_fires_for_first_change_only() {
        let state = state();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = state.once("enabled", move |c| sink.lock().push(c.value.clone()));

        state.set("enabled", json!(false)).unwrap();
        state.set("enabled", json!(true)).unwrap();

        assert_eq!(*seen.lock(), vec![json!(false)]);
        assert!(state.listeners.read().get("enabled").map_or(true, Vec::is_empty));
    }

    #[test]
    fn test_update_from_current_value() {
        let state = state();
        let flipped = state
            .update("learning-activity.playbackRate", |v| json!(!v.as_bool().unwrap_or(false)))
            .unwrap();
        assert!(flipped);
        assert!(state.get_bool("learning-activity.playbackRate"));

        assert!(state.update("exam.counter", |v| json!(v.as_u64().unwrap_or(0) + 1)).unwrap());
        assert_eq!(state.get_path("exam.counter"), Some(json!(1)));
        assert!(!state.update("exam.counter", |v| v).unwrap());
    }

    #[test]
    fn test_listener_may_write_back() {
        let state = Arc::new(state());
        let weak = Arc::downgrade(&state);
        let _sub = state.subscribe(
            "enabled",
            move |change| {
                if let Some(state) = weak.upgrade() {
                    state
                        .set("learning-activity.playbackRate", change.value.clone())
                        .unwrap();
                }
            },
            false,
        );
        state.set("enabled", json!(false)).unwrap();
        assert!(!state.get_bool("learning-activity.playbackRate"));
    }
}
