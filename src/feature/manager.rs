//! Page-level owner of feature modules and the route watcher.
//!
//! The watcher listens for `popstate` and `hashchange` on the window. Bursts
//! of events are debounced; when the last re-evaluation ran longer than the
//! throttle interval ago, a change is processed immediately instead.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tronclass_enhancer::browser::{Page, StaticTransport};
//! use tronclass_enhancer::feature::FeatureManager;
//! use tronclass_enhancer::services::Services;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let page = Page::new("https://lms.example.edu/user/index", Arc::new(StaticTransport::new()))?;
//!     let services = Arc::new(Services::new(page)?);
//!     services.install_hooks()?;
//!
//!     let manager = Arc::new(FeatureManager::new(services));
//!     manager.init_all().await;
//!     manager.start_route_watcher();
//!     Ok(())
//! }
//! ```

use crate::browser::{Listener, ListenerOptions};
use crate::feature::module::FeatureModule;
use crate::feature::FeatureError;
use crate::services::Services;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Default debounce window of route changes.
pub const DEFAULT_ROUTE_DEBOUNCE: Duration = Duration::from_millis(100);

/// Default throttle interval of route changes.
pub const DEFAULT_ROUTE_THROTTLE: Duration = Duration::from_millis(1000);

const ROUTE_EVENTS: [&str; 2] = ["popstate", "hashchange"];

struct RouteWatcher {
    listener: Listener,
    task: JoinHandle<()>,
}

/// Owns the modules of one page.
pub struct FeatureManager {
    services: Arc<Services>,
    modules: RwLock<Vec<Arc<FeatureModule>>>,
    watcher: Mutex<Option<RouteWatcher>>,
    debounce: Duration,
    throttle: Duration,
}

impl FeatureManager {
    /// Creates an empty manager.
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            modules: RwLock::new(Vec::new()),
            watcher: Mutex::new(None),
            debounce: DEFAULT_ROUTE_DEBOUNCE,
            throttle: DEFAULT_ROUTE_THROTTLE,
        }
    }

    /// Sets the route debounce window and throttle interval.
    pub fn with_route_timing(mut self, debounce: Duration, throttle: Duration) -> Self {
        self.debounce = debounce;
        self.throttle = throttle;
        self
    }

    /// Page services.
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Registers a module, replacing any module with the same id.
    pub fn register(&self, module: FeatureModule) -> Arc<FeatureModule> {
        let module = Arc::new(module);
        let mut modules = self.modules.write();
        match modules.iter_mut().find(|m| m.id() == module.id()) {
            Some(existing) => *existing = module.clone(),
            None => modules.push(module.clone()),
        }
        debug!("Registered module {}", module.id());
        module
    }

    /// Looks up a module.
    pub fn get(&self, id: &str) -> Option<Arc<FeatureModule>> {
        self.modules.read().iter().find(|m| m.id() == id).cloned()
    }

    /// Looks up a module or fails.
    pub fn module(&self, id: &str) -> Result<Arc<FeatureModule>, FeatureError> {
        self.get(id)
            .ok_or_else(|| FeatureError::UnknownModule(id.to_string()))
    }

    /// Modules in registration order.
    pub fn modules(&self) -> Vec<Arc<FeatureModule>> {
        self.modules.read().clone()
    }

    /// Initialises every module in registration order.
    pub async fn init_all(&self) {
        for module in self.modules() {
            module.init().await;
        }
        info!("Initialised {} modules", self.modules.read().len());
    }

    /// Re-evaluates route-aware features of every initialised module.
    ///
    /// Returns how many features were re-evaluated.
    pub async fn handle_route_change(&self) -> usize {
        let route = self.services.page().route();
        let mut count = 0;
        for module in self.modules() {
            if !module.is_enabled() || !module.is_initialized() {
                continue;
            }
            for feature in module.features() {
                if feature.check_route_aware(&route) {
                    feature.re_evaluate().await;
                    count += 1;
                }
            }
        }
        debug!("Route {} re-evaluated {} features", route.pathname, count);
        count
    }

    /// Starts the route watcher. Idempotent.
    pub fn start_route_watcher(self: &Arc<Self>) {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Listener::exempt(move |_event| {
            let _ = tx.send(());
        });
        let window = self.services.page().window();
        for event_type in ROUTE_EVENTS {
            window.add_event_listener(event_type, listener.clone(), ListenerOptions::default());
        }

        let task = tokio::spawn(route_loop(
            Arc::downgrade(self),
            rx,
            self.debounce,
            self.throttle,
        ));
        *watcher = Some(RouteWatcher { listener, task });
        debug!("Route watcher started");
    }

    /// Whether the route watcher runs.
    pub fn is_watching(&self) -> bool {
        self.watcher.lock().is_some()
    }

    /// Stops the route watcher.
    pub fn stop_route_watcher(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            let window = self.services.page().window();
            for event_type in ROUTE_EVENTS {
                window.remove_event_listener(event_type, &watcher.listener, ListenerOptions::default());
            }
            watcher.task.abort();
            debug!("Route watcher stopped");
        }
    }

    /// Stops the watcher and disposes every module.
    pub async fn dispose(&self) {
        self.stop_route_watcher();
        for module in self.modules() {
            module.dispose().await;
        }
    }
}

async fn route_loop(
    manager: Weak<FeatureManager>,
    mut rx: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
    throttle: Duration,
) {
    let mut last_run: Option<Instant> = None;
    while rx.recv().await.is_some() {
        let throttle_elapsed =
            |last_run: Option<Instant>| last_run.map_or(true, |at| at.elapsed() >= throttle);
        if !throttle_elapsed(last_run) {
            // Wait for a quiet window, unless the throttle interval runs out first.
            loop {
                match tokio::time::timeout(debounce, rx.recv()).await {
                    Ok(Some(())) if throttle_elapsed(last_run) => break,
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
        }
        while rx.try_recv().is_ok() {}

        let Some(manager) = manager.upgrade() else {
            return;
        };
        manager.handle_route_change().await;
        last_run = Some(Instant::now());
    }
}

impl Drop for FeatureManager {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.task.abort();
        }
    }
}

impl fmt::Debug for FeatureManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.modules.read().iter().map(|m| m.id().to_string()).collect();
        f.debug_struct("FeatureManager")
            .field("modules", &ids)
            .field("watching", &self.is_watching())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{Page, StaticTransport};
    use crate::feature::cleanup::Cleanups;
    use crate::feature::definition::{Feature, FeatureTest, RouteAware};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(url: &str) -> Arc<FeatureManager> {
        let page = Page::new(url, Arc::new(StaticTransport::new())).unwrap();
        let services = Arc::new(Services::new(page).unwrap());
        Arc::new(
            FeatureManager::new(services)
                .with_route_timing(Duration::from_millis(10), Duration::from_millis(1000)),
        )
    }

    fn counted(id: &str, counter: &Arc<AtomicUsize>) -> Feature<()> {
        let counter = counter.clone();
        Feature::enable(id, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Cleanups::new())
            }
        })
    }

    #[tokio::test]
    async fn test_register_replaces_same_id() {
        let manager = manager("https://lms.example.edu/");
        let services = manager.services().clone();
        manager.register(FeatureModule::new("global", services.clone()).unwrap());
        manager.register(FeatureModule::new("global", services).unwrap());
        assert_eq!(manager.modules().len(), 1);
        assert!(manager.get("global").is_some());
        assert!(matches!(manager.module("nope"), Err(FeatureError::UnknownModule(_))));
    }

    #[tokio::test]
    async fn test_route_change_only_touches_route_aware() {
        let manager = manager("https://lms.example.edu/course/1/learning-activity");
        let aware = Arc::new(AtomicUsize::new(0));
        let fixed = Arc::new(AtomicUsize::new(0));
        let module = FeatureModule::new("course", manager.services().clone())
            .unwrap()
            .with_feature("g", counted("aware", &aware).with_route_aware(RouteAware::Always))
            .unwrap()
            .with_feature(
                "g",
                counted("fixed", &fixed)
                    .with_test(FeatureTest::pattern(r"^/course/").unwrap()),
            )
            .unwrap();
        let module = manager.register(module);
        manager.init_all().await;

        manager.services().page().history().push_state("/user/index").unwrap();
        assert_eq!(manager.handle_route_change().await, 1);

        assert_eq!(aware.load(Ordering::SeqCst), 2);
        assert_eq!(fixed.load(Ordering::SeqCst), 1);
        assert!(module.feature("g", "fixed").unwrap().enabled());
    }

    #[tokio::test]
    async fn test_watcher_reacts_to_popstate() {
        let manager = manager("https://lms.example.edu/");
        let hits = Arc::new(AtomicUsize::new(0));
        let module = FeatureModule::new("global", manager.services().clone())
            .unwrap()
            .with_feature("g", counted("f", &hits).with_route_aware(true))
            .unwrap();
        manager.register(module);
        manager.init_all().await;
        manager.start_route_watcher();
        manager.start_route_watcher();

        manager.services().page().history().navigate("/course/2").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        manager.stop_route_watcher();
        assert!(!manager.is_watching());
        manager.services().page().history().navigate("/course/3").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_burst_within_throttle_is_debounced() {
        let manager = manager("https://lms.example.edu/");
        let hits = Arc::new(AtomicUsize::new(0));
        let module = FeatureModule::new("global", manager.services().clone())
            .unwrap()
            .with_feature("g", counted("f", &hits).with_route_aware(true))
            .unwrap();
        manager.register(module);
        manager.init_all().await;
        manager.start_route_watcher();

        let history = manager.services().page().history();
        history.navigate("/a").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        for path in ["/b", "/c", "/d"] {
            history.navigate(path).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        // init + the immediate first change + one debounced run for the burst
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_steady_stream_still_runs_each_throttle_interval() {
        let page = Page::new("https://lms.example.edu/", Arc::new(StaticTransport::new())).unwrap();
        let manager = Arc::new(
            FeatureManager::new(Arc::new(Services::new(page).unwrap()))
                .with_route_timing(Duration::from_millis(100), Duration::from_millis(200)),
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let module = FeatureModule::new("global", manager.services().clone())
            .unwrap()
            .with_feature("g", counted("f", &hits).with_route_aware(true))
            .unwrap();
        manager.register(module);
        manager.init_all().await;
        manager.start_route_watcher();

        // Events every 50ms never leave a 100ms quiet window.
        let history = manager.services().page().history();
        for step in 0..24 {
            history.navigate(&format!("/course/{}", step)).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let during_burst = hits.load(Ordering::SeqCst) - 1;
        assert!(during_burst >= 3, "only {} runs during the burst", during_burst);
    }
}
