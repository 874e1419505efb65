//! Feature modules: groups of features sharing one persisted document.
//!
//! The document of module `id` lives under `<prefix><id>` and has the shape
//! `{ "enabled": bool, "<group>": { "<feature>": bool } }`.

use crate::feature::context::{FeatureContext, FeaturePath};
use crate::feature::definition::Feature;
use crate::feature::i18n::{Label, ModuleI18n};
use crate::feature::lifecycle::{FeatureInfo, FeatureRuntime, FeatureUnit};
use crate::feature::FeatureError;
use crate::services::Services;
use crate::state::PersistentState;
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ordered features of one group.
pub struct FeatureGroup {
    id: String,
    features: Vec<Arc<dyn FeatureUnit>>,
}

impl FeatureGroup {
    /// Group id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Features in registration order.
    pub fn features(&self) -> &[Arc<dyn FeatureUnit>] {
        &self.features
    }
}

impl fmt::Debug for FeatureGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureGroup")
            .field("id", &self.id)
            .field("features", &self.features.len())
            .finish()
    }
}

/// A named area of features.
pub struct FeatureModule {
    id: String,
    services: Arc<Services>,
    state: Arc<PersistentState>,
    groups: Vec<FeatureGroup>,
    i18n: ModuleI18n,
    loaded: AtomicBool,
    initialized: AtomicBool,
}

impl FeatureModule {
    /// Creates an empty module persisted under `<prefix><id>`.
    pub fn new(id: impl Into<String>, services: Arc<Services>) -> Result<Self, FeatureError> {
        let id = id.into();
        let key = format!("{}{}", services.storage_prefix(), id);
        let state = PersistentState::new(key, json!({ "enabled": true }), services.storage().clone())?;
        Ok(Self {
            id,
            services,
            state: Arc::new(state),
            groups: Vec::new(),
            i18n: ModuleI18n::default(),
            loaded: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        })
    }

    /// Attaches translations.
    pub fn with_i18n(mut self, i18n: ModuleI18n) -> Self {
        self.i18n = i18n;
        self
    }

    /// Appends `feature` to `group`, seeding its persisted default.
    pub fn register<C>(&mut self, group: &str, feature: Feature<C>) -> Result<(), FeatureError>
    where
        C: Default + Send + 'static,
    {
        let path = FeaturePath::new(&self.id, group, feature.id());
        if self.feature(group, feature.id()).is_some() {
            return Err(FeatureError::DuplicateFeature(path.to_string()));
        }
        if feature.kind().is_persisted() {
            self.state
                .define(&path.state_path(), json!(feature.default_enabled()))?;
        }

        let ctx = FeatureContext::new(self.services.clone(), self.state.clone(), path);
        let runtime: Arc<dyn FeatureUnit> = Arc::new(FeatureRuntime::new(feature, ctx));

        match self.groups.iter_mut().find(|g| g.id == group) {
            Some(existing) => existing.features.push(runtime),
            None => self.groups.push(FeatureGroup {
                id: group.to_string(),
                features: vec![runtime],
            }),
        }
        Ok(())
    }

    /// Builder form of [`FeatureModule::register`].
    pub fn with_feature<C>(mut self, group: &str, feature: Feature<C>) -> Result<Self, FeatureError>
    where
        C: Default + Send + 'static,
    {
        self.register(group, feature)?;
        Ok(self)
    }

    /// Module id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Persisted document.
    pub fn state(&self) -> &Arc<PersistentState> {
        &self.state
    }

    /// Groups in registration order.
    pub fn groups(&self) -> &[FeatureGroup] {
        &self.groups
    }

    /// Every feature, group by group.
    pub fn features(&self) -> impl Iterator<Item = &Arc<dyn FeatureUnit>> {
        self.groups.iter().flat_map(|g| g.features.iter())
    }

    /// Looks up a feature.
    pub fn feature(&self, group: &str, feature: &str) -> Option<&Arc<dyn FeatureUnit>> {
        self.groups
            .iter()
            .find(|g| g.id == group)?
            .features
            .iter()
            .find(|f| f.info().path.feature == feature)
    }

    /// Static descriptions of every feature.
    pub fn infos(&self) -> Vec<FeatureInfo> {
        self.features().map(|f| f.info()).collect()
    }

    /// Module-level switch.
    pub fn is_enabled(&self) -> bool {
        self.state.get_bool("enabled")
    }

    /// Whether [`FeatureModule::init`] has applied the features.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Loads the persisted document. Runs once; later calls do nothing.
    pub async fn load(&self) {
        if self.loaded.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.init().await;
    }

    /// Loads state and applies every feature with its persisted value.
    ///
    /// A disabled module is loaded but not applied. Calling `init` again
    /// re-applies every feature, which is when deferred toggles take effect.
    pub async fn init(&self) {
        self.load().await;
        if !self.is_enabled() {
            info!("Module {} is disabled, skipping init", self.id);
            return;
        }
        for feature in self.features() {
            feature.initialize().await;
        }
        self.initialized.store(true, Ordering::SeqCst);
        debug!("Module {} initialised ({} features)", self.id, self.features().count());
    }

    /// Clicks a feature. Returns the new value, `None` for click features.
    ///
    /// While the module is disabled only the persisted flag flips; nothing
    /// is applied and click features do nothing.
    pub async fn click(&self, group: &str, feature: &str) -> Result<Option<bool>, FeatureError> {
        let unit = self
            .feature(group, feature)
            .ok_or_else(|| FeatureError::UnknownFeature(format!("{}.{}.{}", self.id, group, feature)))?;
        if self.is_enabled() {
            return Ok(unit.click().await);
        }

        let info = unit.info();
        if !info.persisted {
            debug!("{} ignored, module {} is disabled", info.path, self.id);
            return Ok(None);
        }
        let target = !unit.enabled();
        self.state.set(&info.path.state_path(), json!(target)).await?;
        info!("{} set to {} while module {} is disabled", info.path, target, self.id);
        Ok(Some(target))
    }

    /// Persisted flag of a feature.
    pub fn is_feature_enabled(&self, group: &str, feature: &str) -> bool {
        self.state.get_bool(&format!("{}.{}", group, feature))
    }

    /// Turns the whole module on or off.
    ///
    /// Disabling tears down every activation but keeps the per-feature flags;
    /// enabling initialises the module.
    pub async fn set_module_enabled(&self, enabled: bool) {
        if let Err(e) = self.state.set("enabled", json!(enabled)).await {
            warn!("[FeatureModule:setEnabled] {}: {}", self.id, e);
        }
        if enabled {
            self.init().await;
        } else {
            for feature in self.features() {
                feature.deactivate().await;
            }
            self.initialized.store(false, Ordering::SeqCst);
            info!("Module {} disabled", self.id);
        }
    }

    /// Restores every flag to its registered default.
    ///
    /// Applied features keep their side effects until the next transition.
    pub async fn reset(&self) -> Result<Vec<String>, FeatureError> {
        Ok(self.state.reset(None).await?)
    }

    /// Runs every cleanup, setup included.
    pub async fn dispose(&self) {
        for feature in self.features() {
            feature.dispose().await;
        }
        self.initialized.store(false, Ordering::SeqCst);
    }

    /// Translations.
    pub fn i18n(&self) -> &ModuleI18n {
        &self.i18n
    }

    /// Module label in `language`.
    pub fn label(&self, language: &str) -> Label {
        self.i18n.module_label(language, &self.id)
    }

    /// Group label in `language`.
    pub fn group_label(&self, language: &str, group: &str) -> String {
        self.i18n.group_label(language, group)
    }

    /// Feature label in `language`.
    pub fn feature_label(&self, language: &str, group: &str, feature: &str) -> Label {
        self.i18n.feature_label(language, group, feature)
    }
}

impl fmt::Debug for FeatureModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureModule")
            .field("id", &self.id)
            .field("groups", &self.groups)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
