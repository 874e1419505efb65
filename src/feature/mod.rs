//! Feature registration and lifecycle engine.
//!
//! Features are declared with [`Feature`], grouped into a [`FeatureModule`]
//! that persists their flags, and owned by the page's [`FeatureManager`],
//! which also re-evaluates route-aware features on in-app navigation.
//!
//! - [`definition`] - Feature kinds, tests and builders
//! - [`context`] - Context handed to callbacks
//! - [`cleanup`] - Undo steps
//! - [`lifecycle`] - Per-feature state machine
//! - [`module`] - Modules and groups
//! - [`manager`] - Page-level manager and route watcher
//! - [`i18n`] - Labels per language

pub mod cleanup;
pub mod context;
pub mod definition;
pub mod i18n;
pub mod lifecycle;
pub mod manager;
pub mod module;

use crate::hook::HookInstallError;
use crate::state::StateError;
use thiserror::Error;

pub use cleanup::{Cleanup, Cleanups};
pub use context::{FeatureContext, FeaturePath};
pub use definition::{Feature, FeatureKind, FeatureTest, RouteAware};
pub use i18n::{resolve_language, Label, ModuleI18n, DEFAULT_LANGUAGE, SUPPORTED_LANGUAGES};
pub use lifecycle::{ApplyReason, FeatureInfo, FeaturePhase, FeatureRuntime, FeatureUnit};
pub use manager::{FeatureManager, DEFAULT_ROUTE_DEBOUNCE, DEFAULT_ROUTE_THROTTLE};
pub use module::{FeatureGroup, FeatureModule};

/// Errors raised while building or addressing features.
#[derive(Debug, Error)]
pub enum FeatureError {
    /// A feature with the same id already exists in the group.
    #[error("Duplicate feature: {0}")]
    DuplicateFeature(String),

    /// No module with this id.
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    /// No feature at this path.
    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    /// State failure.
    #[error(transparent)]
    State(#[from] StateError),

    /// Invalid test pattern.
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Hook installation failure.
    #[error(transparent)]
    Hook(#[from] HookInstallError),

    /// Translation document failed to parse.
    #[error("Invalid translations: {0}")]
    I18n(#[from] serde_json::Error),
}
