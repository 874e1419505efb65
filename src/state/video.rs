//! Video playback preferences.
//!
//! `customAutoNextThreshold` is derived: it is the base threshold jittered by
//! up to `autoNextThresholdVariance` in either direction, clamped to `0..=1`,
//! recomputed whenever either input changes and never persisted.

use crate::state::keyed::{KeyedState, StateError, Subscription};
use crate::state::persistent::PersistentState;
use crate::state::storage::StorageBackend;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tracing::warn;

/// Storage key of the video settings.
pub const VIDEO_SETTINGS_KEY: &str = "settings";

/// Default playback rate.
pub const DEFAULT_PLAYBACK_RATE: f64 = 1.75;

const DERIVED_THRESHOLD: &str = "customAutoNextThreshold";

/// Typed view of the video settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSettings {
    /// Advance to the next activity when a video ends.
    pub auto_next: bool,
    /// Played fraction that counts as finished.
    pub auto_next_threshold: f64,
    /// Maximum jitter applied to the threshold.
    pub auto_next_threshold_variance: f64,
    /// Jittered threshold actually used.
    pub custom_auto_next_threshold: f64,
    /// Playback rate applied to course videos.
    pub playback_rate: f64,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            auto_next: true,
            auto_next_threshold: 0.95,
            auto_next_threshold_variance: 0.05,
            custom_auto_next_threshold: 0.0,
            playback_rate: DEFAULT_PLAYBACK_RATE,
        }
    }
}

/// Jitters `base` by a uniform amount in `-variance..=variance`, clamped to `0..=1`.
pub fn jitter_threshold(base: f64, variance: f64) -> f64 {
    let offset = if variance > 0.0 {
        rand::thread_rng().gen_range(-variance..=variance)
    } else {
        0.0
    };
    (base + offset).clamp(0.0, 1.0)
}

fn recompute(state: &Weak<KeyedState>) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let read = |path: &str, fallback: f64| {
        state
            .get_path(path)
            .and_then(|v| v.as_f64())
            .unwrap_or(fallback)
    };
    let defaults = VideoSettings::default();
    let value = jitter_threshold(
        read("autoNextThreshold", defaults.auto_next_threshold),
        read("autoNextThresholdVariance", defaults.auto_next_threshold_variance),
    );
    if let Err(e) = state.set(DERIVED_THRESHOLD, json!(value)) {
        warn!("[VideoSettingsStore:recompute] {}", e);
    }
}

/// Persistent video preferences.
pub struct VideoSettingsStore {
    inner: PersistentState,
    _derived: Vec<Subscription>,
}

impl VideoSettingsStore {
    /// Creates the store and computes the initial jittered threshold.
    pub fn new(storage: Arc<dyn StorageBackend>) -> Result<Self, StateError> {
        let defaults = serde_json::to_value(VideoSettings::default())?;
        let inner = PersistentState::new(VIDEO_SETTINGS_KEY, defaults, storage)?
            .with_exclude([DERIVED_THRESHOLD]);

        let mut derived = Vec::new();
        for path in ["autoNextThreshold", "autoNextThresholdVariance"] {
            let weak = Arc::downgrade(inner.state());
            derived.push(inner.subscribe(path, move |_| recompute(&weak), true));
        }

        Ok(Self {
            inner,
            _derived: derived,
        })
    }

    /// Loads stored preferences.
    pub async fn init(&self) {
        self.inner.init().await;
    }

    /// Underlying persistent state.
    pub fn state(&self) -> &PersistentState {
        &self.inner
    }

    /// Typed snapshot.
    pub fn settings(&self) -> VideoSettings {
        self.inner.snapshot_as().unwrap_or_default()
    }

    /// Current playback rate.
    pub fn playback_rate(&self) -> f64 {
        self.settings().playback_rate
    }

    /// Threshold after jitter.
    pub fn custom_auto_next_threshold(&self) -> f64 {
        self.settings().custom_auto_next_threshold
    }

    /// Writes one preference.
    pub async fn set(&self, path: &str, value: Value) -> Result<bool, StateError> {
        self.inner.set(path, value).await
    }

    /// Sets the playback rate.
    pub async fn set_playback_rate(&self, rate: f64) -> Result<bool, StateError> {
        self.inner.set("playbackRate", json!(rate)).await
    }

    /// Turns auto-advance on.
    pub async fn enable_auto_next(&self) -> Result<bool, StateError> {
        self.inner.set("autoNext", json!(true)).await
    }

    /// Turns auto-advance off.
    pub async fn disable_auto_next(&self) -> Result<bool, StateError> {
        self.inner.set("autoNext", json!(false)).await
    }

    /// Restores defaults.
    pub async fn reset(&self, path: Option<&str>) -> Result<Vec<String>, StateError> {
        let changed = self.inner.reset(path).await?;
        // Resetting writes the stored default over the derived value.
        recompute(&Arc::downgrade(self.inner.state()));
        Ok(changed)
    }
}

impl std::fmt::Debug for VideoSettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoSettingsStore")
            .field("settings", &self.settings())
            .finish()
    }
}
