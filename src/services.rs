//! Page-scoped services shared by every feature.
//!
//! One [`Services`] is built per loaded page and handed by reference to the
//! feature layer. Nothing here is a process-wide global, so tests construct
//! as many isolated pages as they need.

use crate::browser::{DomAccessor, Page};
use crate::hook::{EventHookRegistry, HookInstallError, NativeVault, RequestHookRegistry};
use crate::notify::{Notifier, ToastOptions, TracingNotifier};
use crate::state::{MemoryStorage, StateError, StorageBackend, VideoSettingsStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Storage key prefix of feature modules.
pub const DEFAULT_STORAGE_PREFIX: &str = "mk-feature-";

/// Default timeout of DOM waits.
pub const DEFAULT_DOM_WAIT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Services bound to one page.
pub struct Services {
    page: Arc<Page>,
    events: Arc<EventHookRegistry>,
    requests: Arc<RequestHookRegistry>,
    dom: Arc<dyn DomAccessor>,
    notifier: Arc<dyn Notifier>,
    storage: Arc<dyn StorageBackend>,
    video: Arc<VideoSettingsStore>,
    storage_prefix: String,
    dom_wait_timeout: Duration,
    language: String,
}

impl Services {
    /// Creates services for `page` with in-memory storage and a logging notifier.
    pub fn new(page: Arc<Page>) -> Result<Self, StateError> {
        Self::with_storage(page, Arc::new(MemoryStorage::new()))
    }

    /// Creates services for `page` persisting into `storage`.
    pub fn with_storage(page: Arc<Page>, storage: Arc<dyn StorageBackend>) -> Result<Self, StateError> {
        let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
        let requests = RequestHookRegistry::new(page.location().clone()).with_notifier(notifier.clone());
        let language = crate::feature::resolve_language(&page.navigator_language()).to_string();
        Ok(Self {
            dom: page.dom(),
            events: Arc::new(EventHookRegistry::new()),
            requests: Arc::new(requests),
            video: Arc::new(VideoSettingsStore::new(storage.clone())?),
            notifier,
            storage,
            storage_prefix: DEFAULT_STORAGE_PREFIX.to_string(),
            dom_wait_timeout: DEFAULT_DOM_WAIT_TIMEOUT,
            language,
            page,
        })
    }

    /// Replaces the notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        let requests = RequestHookRegistry::new(self.page.location().clone()).with_notifier(notifier.clone());
        self.requests = Arc::new(requests);
        self.notifier = notifier;
        self
    }

    /// Replaces the DOM accessor.
    pub fn with_dom(mut self, dom: Arc<dyn DomAccessor>) -> Self {
        self.dom = dom;
        self
    }

    /// Sets the storage key prefix of feature modules.
    pub fn with_storage_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage_prefix = prefix.into();
        self
    }

    /// Sets the DOM wait timeout.
    pub fn with_dom_wait_timeout(mut self, timeout: Duration) -> Self {
        self.dom_wait_timeout = timeout;
        self
    }

    /// Overrides the UI language.
    pub fn with_language(mut self, language: &str) -> Self {
        self.language = crate::feature::resolve_language(language).to_string();
        self
    }

    /// Installs the event and request hooks into the page realm. Idempotent.
    pub fn install_hooks(&self) -> Result<(), HookInstallError> {
        self.events.install(self.page.realm())?;
        self.requests.install(self.page.realm())?;
        debug!("Hooks installed on {}", self.page.location().href());
        Ok(())
    }

    /// The page.
    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    /// Natives captured at page load.
    pub fn vault(&self) -> Arc<NativeVault> {
        self.page.vault()
    }

    /// Event-hook registry.
    pub fn events(&self) -> &Arc<EventHookRegistry> {
        &self.events
    }

    /// Request-hook registry.
    pub fn requests(&self) -> &Arc<RequestHookRegistry> {
        &self.requests
    }

    /// DOM helpers.
    pub fn dom(&self) -> &Arc<dyn DomAccessor> {
        &self.dom
    }

    /// Toast side channel.
    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Shows a toast.
    pub fn toast(&self, message: &str, options: ToastOptions) {
        self.notifier.show(message, options);
    }

    /// Storage backend.
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Video preferences.
    pub fn video(&self) -> &Arc<VideoSettingsStore> {
        &self.video
    }

    /// Storage key prefix of feature modules.
    pub fn storage_prefix(&self) -> &str {
        &self.storage_prefix
    }

    /// Timeout of DOM waits.
    pub fn dom_wait_timeout(&self) -> Duration {
        self.dom_wait_timeout
    }

    /// Resolved UI language.
    pub fn language(&self) -> &str {
        &self.language
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("page", &self.page.location().href())
            .field("storage_prefix", &self.storage_prefix)
            .field("language", &self.language)
            .finish()
    }
}
