//! Context handed to feature callbacks.

use crate::browser::Page;
use crate::notify::{ToastKind, ToastOptions};
use crate::services::Services;
use crate::state::PersistentState;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Address of a feature: `module.group.feature`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeaturePath {
    /// Module id.
    pub module: String,
    /// Group id.
    pub group: String,
    /// Feature id, unique within the group.
    pub feature: String,
}

impl FeaturePath {
    /// Creates a path.
    pub fn new(module: impl Into<String>, group: impl Into<String>, feature: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            group: group.into(),
            feature: feature.into(),
        }
    }

    /// Path of the feature's flag inside its module state.
    pub fn state_path(&self) -> String {
        format!("{}.{}", self.group, self.feature)
    }
}

impl fmt::Display for FeaturePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.module, self.group, self.feature)
    }
}

/// Per-feature context.
///
/// `C` is the feature's scratch type, shared between `setup`, `enable`,
/// `disable` and `toggle` of the same feature instance.
pub struct FeatureContext<C> {
    services: Arc<Services>,
    module_state: Arc<PersistentState>,
    path: Arc<FeaturePath>,
    scratch: Arc<Mutex<C>>,
}

impl<C> Clone for FeatureContext<C> {
    fn clone(&self) -> Self {
        Self {
            services: self.services.clone(),
            module_state: self.module_state.clone(),
            path: self.path.clone(),
            scratch: self.scratch.clone(),
        }
    }
}

impl<C: Default> FeatureContext<C> {
    pub(crate) fn new(services: Arc<Services>, module_state: Arc<PersistentState>, path: FeaturePath) -> Self {
        Self {
            services,
            module_state,
            path: Arc::new(path),
            scratch: Arc::new(Mutex::new(C::default())),
        }
    }
}

impl<C> FeatureContext<C> {
    /// Page services.
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// The page.
    pub fn page(&self) -> &Arc<Page> {
        self.services.page()
    }

    /// Feature address.
    pub fn path(&self) -> &FeaturePath {
        &self.path
    }

    /// State of the owning module.
    pub fn module_state(&self) -> &Arc<PersistentState> {
        &self.module_state
    }

    /// Persisted flag of this feature.
    pub fn enabled(&self) -> bool {
        self.module_state.get_bool(&self.path.state_path())
    }

    /// Runs `f` with the scratch value locked.
    pub fn scratch<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.scratch.lock())
    }

    /// Shows a toast.
    pub fn toast(&self, message: &str, kind: ToastKind) {
        self.services.toast(message, ToastOptions::kind(kind));
    }
}

impl<C> fmt::Debug for FeatureContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureContext").field("path", &self.path).finish()
    }
}
