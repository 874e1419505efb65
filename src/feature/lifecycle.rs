//! Per-feature lifecycle.
//!
//! [`FeatureRuntime`] owns one feature's activation state and drives it
//! through `Uninitialized → {Inapplicable, Applied(true), Applied(false)}`.
//! Every transition (init, click, route change, module disable) takes the
//! same FIFO lock, so at most one transition per feature is in flight and
//! at most one activation's cleanups are live at a time.
//!
//! Errors and panics in feature callbacks are caught here and logged with the
//! feature path; they never reach the module or the manager.

use crate::browser::RouteInfo;
use crate::feature::cleanup::Cleanups;
use crate::feature::context::{FeatureContext, FeaturePath};
use crate::feature::definition::{CallbackFuture, Feature, FeatureKind};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::json;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Why a transition runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyReason {
    /// Module initialisation.
    Init,
    /// User toggle.
    Click,
    /// In-app navigation.
    RouteChange,
}

impl fmt::Display for ApplyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApplyReason::Init => "init",
            ApplyReason::Click => "click",
            ApplyReason::RouteChange => "routeChange",
        })
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeaturePhase {
    /// Never initialised, or torn down by a module disable.
    Uninitialized,
    /// The test does not match the current page.
    Inapplicable,
    /// Applied with the given value.
    Applied {
        /// Value the active side effects correspond to.
        enabled: bool,
    },
}

/// Static description of a feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureInfo {
    /// Address.
    pub path: FeaturePath,
    /// Kind name.
    pub kind: &'static str,
    /// Whether toggles apply immediately.
    pub live_reload: bool,
    /// Whether route changes can re-evaluate it.
    pub route_aware: bool,
    /// Experimental flag.
    pub experimental: bool,
    /// Whether it carries a persisted flag.
    pub persisted: bool,
    /// Default of the persisted flag.
    pub default_enabled: bool,
}

/// Type-erased feature runtime, as held by modules.
#[async_trait]
pub trait FeatureUnit: Send + Sync {
    /// Static description.
    fn info(&self) -> FeatureInfo;

    /// Current lifecycle state.
    fn phase(&self) -> FeaturePhase;

    /// Persisted flag.
    fn enabled(&self) -> bool;

    /// Whether a change to `route` should re-evaluate this feature.
    fn check_route_aware(&self, route: &RouteInfo) -> bool;

    /// Evaluates the test; tears down the activation when it fails.
    async fn check(&self) -> bool;

    /// Central transition.
    async fn apply_option(&self, reason: ApplyReason, value: Option<bool>);

    /// Module-init transition with the persisted value.
    async fn initialize(&self) {
        self.apply_option(ApplyReason::Init, None).await
    }

    /// Route-change transition.
    async fn re_evaluate(&self) {
        self.apply_option(ApplyReason::RouteChange, None).await
    }

    /// User click. Returns the new persisted value, `None` for click features.
    async fn click(&self) -> Option<bool>;

    /// Runs activation cleanups, keeping setup cleanups and the persisted flag.
    async fn deactivate(&self);

    /// Runs every cleanup, setup included.
    async fn dispose(&self);
}

#[derive(Default)]
struct Activation {
    setup_done: bool,
    setup_cleanups: Cleanups,
    cleanups: Cleanups,
    applied: Option<bool>,
}

/// Runtime of one feature with scratch type `C`.
pub struct FeatureRuntime<C> {
    feature: Feature<C>,
    ctx: FeatureContext<C>,
    activation: Mutex<Activation>,
    phase: RwLock<FeaturePhase>,
}

impl<C: Default + Send + 'static> FeatureRuntime<C> {
    /// Binds `feature` to its context.
    pub fn new(feature: Feature<C>, ctx: FeatureContext<C>) -> Self {
        Self {
            feature,
            ctx,
            activation: Mutex::new(Activation::default()),
            phase: RwLock::new(FeaturePhase::Uninitialized),
        }
    }

    /// Feature definition.
    pub fn feature(&self) -> &Feature<C> {
        &self.feature
    }

    /// Callback context.
    pub fn context(&self) -> &FeatureContext<C> {
        &self.ctx
    }

    fn path(&self) -> &FeaturePath {
        self.ctx.path()
    }

    fn persisted(&self) -> bool {
        self.ctx.enabled()
    }

    async fn persist(&self, value: bool) {
        if !self.feature.kind().is_persisted() {
            return;
        }
        if let Err(e) = self
            .ctx
            .module_state()
            .set(&self.path().state_path(), json!(value))
            .await
        {
            warn!("[Feature:persist] {}: {}", self.path(), e);
        }
    }

    /// Runs a callback, converting errors and panics into empty cleanups.
    async fn guarded<F>(&self, method: &str, start: F) -> Cleanups
    where
        F: FnOnce() -> CallbackFuture,
    {
        let future = match catch_unwind(AssertUnwindSafe(start)) {
            Ok(future) => future,
            Err(_) => {
                error!("[Feature:{}] {} panicked", method, self.path());
                return Cleanups::new();
            }
        };
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(cleanups)) => cleanups,
            Ok(Err(e)) => {
                error!("[Feature:{}] {}: {:#}", method, self.path(), e);
                Cleanups::new()
            }
            Err(_) => {
                error!("[Feature:{}] {} panicked", method, self.path());
                Cleanups::new()
            }
        }
    }

    async fn teardown(&self, activation: &mut Activation) {
        let cleanups = activation.cleanups.take();
        if !cleanups.is_empty() {
            debug!("Running {} cleanups of {}", cleanups.len(), self.path());
            cleanups.run_all(&self.path().to_string()).await;
        }
        activation.applied = None;
    }

    async fn check_locked(&self, activation: &mut Activation) -> bool {
        let route = self.ctx.page().route();
        let applicable = match AssertUnwindSafe(self.feature.test().evaluate(&route))
            .catch_unwind()
            .await
        {
            Ok(Ok(applicable)) => applicable,
            Ok(Err(e)) => {
                error!("[Feature:test] {}: {:#}", self.path(), e);
                false
            }
            Err(_) => {
                error!("[Feature:test] {} panicked", self.path());
                false
            }
        };
        if !applicable {
            self.teardown(activation).await;
            *self.phase.write() = FeaturePhase::Inapplicable;
        }
        applicable
    }

    async fn run_setup(&self, activation: &mut Activation, value: bool) {
        if activation.setup_done {
            return;
        }
        activation.setup_done = true;
        if let Some(setup) = self.feature.setup() {
            let ctx = self.ctx.clone();
            let cleanups = self.guarded("setup", || setup(ctx, value)).await;
            activation.setup_cleanups.append(cleanups);
        }
    }

    async fn dispatch(&self, value: bool) -> Cleanups {
        let ctx = self.ctx.clone();
        match self.feature.kind() {
            FeatureKind::Toggle(toggle) => self.guarded("toggle", || toggle(value, ctx)).await,
            FeatureKind::EnableDisable { enable, disable } => {
                let (method, callback) = if value {
                    ("enable", enable)
                } else {
                    ("disable", disable)
                };
                match callback {
                    Some(callback) => self.guarded(method, || callback(ctx)).await,
                    None => Cleanups::new(),
                }
            }
            FeatureKind::SetupOnly | FeatureKind::Click(_) => Cleanups::new(),
        }
    }

    async fn transition(&self, activation: &mut Activation, reason: ApplyReason, value: Option<bool>) {
        let target = value.unwrap_or_else(|| self.persisted());

        if reason != ApplyReason::Init && !self.feature.live_reload() {
            self.persist(target).await;
            debug!(
                "{} set to {} on {}, applied on next init",
                self.path(),
                target,
                reason
            );
            return;
        }

        if !self.check_locked(activation).await {
            if reason == ApplyReason::Click {
                self.persist(target).await;
            }
            debug!("{} is not applicable ({})", self.path(), reason);
            return;
        }

        self.run_setup(activation, target).await;

        let unchanged = activation.applied == Some(target);
        if !unchanged || reason == ApplyReason::RouteChange {
            self.teardown(activation).await;
            let cleanups = self.dispatch(target).await;
            activation.cleanups.append(cleanups);
            activation.applied = Some(target);
        }

        self.persist(target).await;
        *self.phase.write() = FeaturePhase::Applied { enabled: target };
        debug!("{} applied as {} ({})", self.path(), target, reason);
    }
}

#[async_trait]
impl<C: Default + Send + 'static> FeatureUnit for FeatureRuntime<C> {
    fn info(&self) -> FeatureInfo {
        FeatureInfo {
            path: self.path().clone(),
            kind: self.feature.kind().name(),
            live_reload: self.feature.live_reload(),
            route_aware: self.feature.route_aware().is_enabled(),
            experimental: self.feature.is_experimental(),
            persisted: self.feature.kind().is_persisted(),
            default_enabled: self.feature.default_enabled(),
        }
    }

    fn phase(&self) -> FeaturePhase {
        *self.phase.read()
    }

    fn enabled(&self) -> bool {
        self.persisted()
    }

    fn check_route_aware(&self, route: &RouteInfo) -> bool {
        match catch_unwind(AssertUnwindSafe(|| self.feature.route_aware().applies(route))) {
            Ok(applies) => applies,
            Err(_) => {
                error!("[Feature:routeAware] {} panicked", self.path());
                false
            }
        }
    }

    async fn check(&self) -> bool {
        let mut activation = self.activation.lock().await;
        self.check_locked(&mut activation).await
    }

    async fn apply_option(&self, reason: ApplyReason, value: Option<bool>) {
        let mut activation = self.activation.lock().await;
        self.transition(&mut activation, reason, value).await;
    }

    async fn click(&self) -> Option<bool> {
        match self.feature.kind() {
            FeatureKind::Click(click) => {
                let mut activation = self.activation.lock().await;
                let ctx = self.ctx.clone();
                let cleanups = self.guarded("click", || click(ctx)).await;
                activation.cleanups.append(cleanups);
                info!("{} clicked", self.path());
                None
            }
            _ => {
                let mut activation = self.activation.lock().await;
                let target = !self.persisted();
                self.transition(&mut activation, ApplyReason::Click, Some(target))
                    .await;
                info!("{} toggled to {}", self.path(), target);
                Some(target)
            }
        }
    }

    async fn deactivate(&self) {
        let mut activation = self.activation.lock().await;
        self.teardown(&mut activation).await;
        *self.phase.write() = FeaturePhase::Uninitialized;
    }

    async fn dispose(&self) {
        let mut activation = self.activation.lock().await;
        self.teardown(&mut activation).await;
        let setup = activation.setup_cleanups.take();
        setup.run_all(&self.path().to_string()).await;
        activation.setup_done = false;
        *self.phase.write() = FeaturePhase::Uninitialized;
    }
}

impl<C> fmt::Debug for FeatureRuntime<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureRuntime")
            .field("path", self.ctx.path())
            .field("phase", &*self.phase.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{Page, StaticTransport};
    use crate::feature::cleanup::Cleanup;
    use crate::feature::definition::FeatureTest;
    use crate::services::Services;
    use crate::state::{MemoryStorage, PersistentState};
    use parking_lot::Mutex as SyncMutex;
    use std::sync::Arc;

    struct Harness {
        page: Arc<Page>,
        services: Arc<Services>,
        state: Arc<PersistentState>,
    }

    fn harness(url: &str) -> Harness {
        let page = Page::new(url, Arc::new(StaticTransport::new())).unwrap();
        let services = Arc::new(Services::new(page.clone()).unwrap());
        let state = Arc::new(
            PersistentState::new(
                "mk-feature-test",
                json!({"enabled": true, "group": {"feature": true}}),
                Arc::new(MemoryStorage::new()),
            )
            .unwrap(),
        );
        Harness { page, services, state }
    }

    fn runtime<C: Default + Send + 'static>(h: &Harness, feature: Feature<C>) -> FeatureRuntime<C> {
        let ctx = FeatureContext::new(
            h.services.clone(),
            h.state.clone(),
            FeaturePath::new("test", "group", "feature"),
        );
        FeatureRuntime::new(feature, ctx)
    }

    type Log = Arc<SyncMutex<Vec<String>>>;

    fn toggle_feature(log: &Log) -> Feature<()> {
        let log = log.clone();
        Feature::toggle("feature", move |value, _ctx| {
            let log = log.clone();
            async move {
                log.lock().push(format!("toggle:{}", value));
                let undo = log.clone();
                Ok(Cleanups::new().with(Cleanup::new(move || undo.lock().push(format!("undo:{}", value)))))
            }
        })
    }

    #[tokio::test]
    async fn test_toggle_round_trip() {
        let h = harness("https://lms.example.edu/course/1/learning-activity");
        let log: Log = Arc::default();
        let rt = runtime(&h, toggle_feature(&log));

        rt.initialize().await;
        assert_eq!(rt.phase(), FeaturePhase::Applied { enabled: true });

        assert_eq!(rt.click().await, Some(false));
        assert_eq!(rt.click().await, Some(true));
        assert!(h.state.get_bool("group.feature"));
        assert_eq!(rt.phase(), FeaturePhase::Applied { enabled: true });

        assert_eq!(
            *log.lock(),
            vec!["toggle:true", "undo:true", "toggle:false", "undo:false", "toggle:true"]
        );
    }

    #[tokio::test]
    async fn test_live_reload_false_defers_until_init() {
        let h = harness("https://lms.example.edu/");
        let log: Log = Arc::default();
        let rt = runtime(&h, toggle_feature(&log).with_live_reload(false));

        rt.initialize().await;
        assert_eq!(rt.click().await, Some(false));
        assert!(!h.state.get_bool("group.feature"));
        assert_eq!(*log.lock(), vec!["toggle:true"]);

        rt.initialize().await;
        assert_eq!(*log.lock(), vec!["toggle:true", "undo:true", "toggle:false"]);
    }

    #[tokio::test]
    async fn test_inapplicable_check_runs_cleanup_once() {
        let h = harness("https://lms.example.edu/course/9/learning-activity");
        let log: Log = Arc::default();
        let feature = toggle_feature(&log)
            .with_test(FeatureTest::pattern(r"^/course/\d+/learning-activity").unwrap());
        let rt = runtime(&h, feature);

        rt.initialize().await;
        h.page.history().push_state("/dashboard").unwrap();

        assert!(!rt.check().await);
        assert!(!rt.check().await);
        assert_eq!(rt.phase(), FeaturePhase::Inapplicable);
        assert_eq!(*log.lock(), vec!["toggle:true", "undo:true"]);
    }

    #[tokio::test]
    async fn test_enable_disable_pair_and_missing_disable() {
        let h = harness("https://lms.example.edu/");
        let log: Log = Arc::default();
        let (on, off) = (log.clone(), log.clone());
        let feature = Feature::<()>::enable("feature", move |_| {
            let on = on.clone();
            async move {
                on.lock().push("enable".to_string());
                Ok(Cleanups::new())
            }
        })
        .with_disable(move |_| {
            let off = off.clone();
            async move {
                off.lock().push("disable".to_string());
                Ok(Cleanups::new())
            }
        });
        let rt = runtime(&h, feature);

        rt.initialize().await;
        rt.click().await;
        assert_eq!(*log.lock(), vec!["enable", "disable"]);

        let enable_only = Feature::<()>::enable("feature", |_| async { Ok(Cleanups::new()) });
        let h2 = harness("https://lms.example.edu/");
        let rt2 = runtime(&h2, enable_only);
        rt2.initialize().await;
        assert_eq!(rt2.click().await, Some(false));
        assert_eq!(rt2.phase(), FeaturePhase::Applied { enabled: false });
    }

    #[tokio::test]
    async fn test_setup_runs_once_and_survives_deactivate() {
        let h = harness("https://lms.example.edu/");
        let log: Log = Arc::default();
        let setup_log = log.clone();
        let feature = toggle_feature(&log).with_setup(move |_ctx, value| {
            let setup_log = setup_log.clone();
            async move {
                setup_log.lock().push(format!("setup:{}", value));
                let undo = setup_log.clone();
                Ok(Cleanups::new().with(Cleanup::new(move || undo.lock().push("unsetup".to_string()))))
            }
        });
        let rt = runtime(&h, feature);

        rt.initialize().await;
        rt.initialize().await;
        rt.deactivate().await;
        assert_eq!(rt.phase(), FeaturePhase::Uninitialized);
        rt.dispose().await;

        assert_eq!(
            *log.lock(),
            vec!["setup:true", "toggle:true", "undo:true", "unsetup"]
        );
    }

    #[tokio::test]
    async fn test_callback_errors_and_panics_are_contained() {
        let h = harness("https://lms.example.edu/");
        let failing = Feature::<()>::enable("feature", |_| async { Err(anyhow::anyhow!("boom")) });
        let rt = runtime(&h, failing);
        rt.initialize().await;
        assert_eq!(rt.phase(), FeaturePhase::Applied { enabled: true });

        let panicking = Feature::<()>::toggle("feature", |_, _| async {
            if true {
                panic!("kaboom");
            }
            Ok(Cleanups::new())
        })
            .with_test(FeatureTest::predicate(|_| async { Err(anyhow::anyhow!("test failed")) }));
        let rt = runtime(&h, panicking);
        rt.initialize().await;
        assert_eq!(rt.phase(), FeaturePhase::Inapplicable);
    }

    #[tokio::test]
    async fn test_click_feature_tracks_cleanup() {
        let h = harness("https://lms.example.edu/");
        let log: Log = Arc::default();
        let click_log = log.clone();
        let feature = Feature::<()>::click("feature", move |_| {
            let click_log = click_log.clone();
            async move {
                click_log.lock().push("click".to_string());
                let undo = click_log.clone();
                Ok(Cleanups::new().with(Cleanup::new(move || undo.lock().push("undo".to_string()))))
            }
        });
        let rt = runtime(&h, feature);

        assert_eq!(rt.click().await, None);
        rt.dispose().await;
        assert_eq!(*log.lock(), vec!["click", "undo"]);
    }

    #[tokio::test]
    async fn test_async_cleanup_finishes_before_next_callback() {
        let h = harness("https://lms.example.edu/");
        let log: Log = Arc::default();
        let sink = log.clone();
        let feature = Feature::<()>::toggle("feature", move |value, _ctx| {
            let log = sink.clone();
            async move {
                log.lock().push(format!("toggle:{}", value));
                let undo = log.clone();
                Ok(Cleanups::new().with(Cleanup::future(move || async move {
                    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                    undo.lock().push(format!("undo:{}", value));
                })))
            }
        });
        let rt = runtime(&h, feature);
        rt.initialize().await;

        let (first, second) = tokio::join!(rt.click(), rt.click());
        assert_eq!((first, second), (Some(false), Some(true)));
        assert_eq!(
            *log.lock(),
            vec!["toggle:true", "undo:true", "toggle:false", "undo:false", "toggle:true"]
        );
    }

    #[tokio::test]
    async fn test_scratch_is_shared_between_callbacks() {
        #[derive(Default)]
        struct Scratch {
            original: Option<String>,
        }

        let h = harness("https://lms.example.edu/");
        let feature = Feature::<Scratch>::enable("feature", |ctx| async move {
            ctx.scratch(|s| s.original = Some("1x".to_string()));
            Ok(Cleanups::new())
        })
        .with_disable(|ctx| async move {
            let original = ctx.scratch(|s| s.original.take());
            anyhow::ensure!(original.as_deref() == Some("1x"), "scratch lost");
            Ok(Cleanups::new())
        });
        let rt = runtime(&h, feature);
        rt.initialize().await;
        rt.click().await;
        assert!(rt.context().scratch(|s| s.original.is_none()));
    }
}
