//! Request-hook registry.
//!
//! Rewrites response bodies of matching API calls before page code sees them.
//! Hooks run in registration order and chain: each one receives the text
//! produced by the previous one. A failing or panicking transform is logged
//! and skipped; the request itself always completes.
//!
//! # Example
//!
//! ```rust
//! use tronclass_enhancer::browser::Location;
//! use tronclass_enhancer::hook::{json_transform, RequestHookRegistry, UrlMatcher};
//!
//! let registry = RequestHookRegistry::new(Location::new("https://lms.example.edu/").unwrap());
//! let _hook = registry.register_request_hook(
//!     UrlMatcher::path(r"^/api/activities/(\d+)/?$").unwrap(),
//!     json_transform(|body| {
//!         body["data"]["allow_download"] = true.into();
//!         Ok(true)
//!     }),
//! );
//!
//! let text = registry.run_request_hooks("/api/activities/42", r#"{"data":{"allow_download":false}}"#);
//! assert_eq!(text, r#"{"data":{"allow_download":true}}"#);
//! ```

use crate::browser::event::{Listener, ListenerOptions};
use crate::browser::location::Location;
use crate::browser::network::{
    FetchFuture, FetchRequest, NetworkError, XhrOpen, XhrSend, XhrSendFuture, XmlHttpRequest,
};
use crate::hook::point::{Next, Unhook};
use crate::hook::realm::Realm;
use crate::hook::{slots, HookInstallError};
use crate::notify::{Notifier, ToastKind, ToastOptions};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};

/// Expando property recording the URL passed to `open`.
const XHR_URL_KEY: &str = "__xhr_url";

/// Body transform. `Ok(None)` means "leave unchanged".
pub type TransformFn = Arc<dyn Fn(&str) -> anyhow::Result<Option<String>> + Send + Sync>;

/// Toast shown by the `fetch` hook when a response body was rewritten.
pub const RESPONSE_MODIFIED_TOAST: &str = "Response modified by hook";

/// Decides which requests a hook applies to.
#[derive(Clone)]
pub enum UrlMatcher {
    /// The URL exactly as requested, or its resolved absolute form.
    Exact(String),
    /// Regex over the pathname of same-origin requests.
    Path(Regex),
    /// Arbitrary predicate over the raw URL.
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl UrlMatcher {
    /// Exact matcher.
    pub fn exact(url: impl Into<String>) -> Self {
        Self::Exact(url.into())
    }

    /// Same-origin pathname matcher.
    pub fn path(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::Path(Regex::new(pattern)?))
    }

    /// Predicate matcher.
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(predicate))
    }

    /// Whether `url`, requested from a page at `location`, matches.
    pub fn matches(&self, url: &str, location: &Location) -> bool {
        match self {
            UrlMatcher::Exact(expected) => {
                expected == url
                    || location
                        .resolve(url)
                        .map(|resolved| resolved.as_str() == expected)
                        .unwrap_or(false)
            }
            UrlMatcher::Path(pattern) => match location.resolve(url) {
                Ok(resolved) => {
                    resolved.origin().ascii_serialization() == location.origin()
                        && pattern.is_match(resolved.path())
                }
                Err(_) => false,
            },
            UrlMatcher::Predicate(predicate) => predicate(url),
        }
    }
}

impl fmt::Debug for UrlMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlMatcher::Exact(url) => f.debug_tuple("Exact").field(url).finish(),
            UrlMatcher::Path(pattern) => f.debug_tuple("Path").field(&pattern.as_str()).finish(),
            UrlMatcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Wraps a JSON-editing closure as a [`TransformFn`].
///
/// The closure returns whether it changed the document. Key order is kept.
pub fn json_transform<F>(edit: F) -> TransformFn
where
    F: Fn(&mut Value) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    Arc::new(move |text: &str| {
        let mut document: Value = serde_json::from_str(text)?;
        if edit(&mut document)? {
            Ok(Some(serde_json::to_string(&document)?))
        } else {
            Ok(None)
        }
    })
}

static NEXT_REQUEST_HOOK: AtomicU64 = AtomicU64::new(1);

struct RequestHookEntry {
    id: u64,
    matcher: UrlMatcher,
    transform: TransformFn,
    enabled: AtomicBool,
}

/// Handle of one registered request hook.
pub struct RequestHookController {
    entry: Arc<RequestHookEntry>,
    registry: Weak<RwLock<Vec<Arc<RequestHookEntry>>>>,
}

impl RequestHookController {
    /// Re-enables the hook.
    pub fn enable(&self) {
        self.entry.enabled.store(true, Ordering::SeqCst);
    }

    /// Skips the hook without unregistering it.
    pub fn disable(&self) {
        self.entry.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether the hook is enabled.
    pub fn is_enabled(&self) -> bool {
        self.entry.enabled.load(Ordering::SeqCst)
    }

    /// Removes the hook from its registry. Returns `false` if already removed.
    pub fn unregister(&self) -> bool {
        let Some(entries) = self.registry.upgrade() else {
            return false;
        };
        let mut entries = entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.id != self.entry.id);
        before != entries.len()
    }
}

impl fmt::Debug for RequestHookController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHookController")
            .field("id", &self.entry.id)
            .field("matcher", &self.entry.matcher)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Registry of response-body rewriting hooks.
pub struct RequestHookRegistry {
    location: Location,
    entries: Arc<RwLock<Vec<Arc<RequestHookEntry>>>>,
    notifier: Option<Arc<dyn Notifier>>,
    xhr_unhooks: Mutex<Vec<Unhook>>,
    fetch_unhook: Mutex<Option<Unhook>>,
}

impl RequestHookRegistry {
    /// Creates a registry for a page at `location`.
    pub fn new(location: Location) -> Self {
        Self {
            location,
            entries: Arc::new(RwLock::new(Vec::new())),
            notifier: None,
            xhr_unhooks: Mutex::new(Vec::new()),
            fetch_unhook: Mutex::new(None),
        }
    }

    /// Toasts [`RESPONSE_MODIFIED_TOAST`] whenever a `fetch` response is
    /// rewritten, after the hooks' own toasts. XHR rewrites stay silent.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Appends a hook.
    pub fn register_request_hook(&self, matcher: UrlMatcher, transform: TransformFn) -> RequestHookController {
        let entry = Arc::new(RequestHookEntry {
            id: NEXT_REQUEST_HOOK.fetch_add(1, Ordering::Relaxed),
            matcher,
            transform,
            enabled: AtomicBool::new(true),
        });
        debug!("Registered request hook #{} ({:?})", entry.id, entry.matcher);
        self.entries.write().push(entry.clone());
        RequestHookController {
            entry,
            registry: Arc::downgrade(&self.entries),
        }
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no hook is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Runs every enabled, matching hook over `text`, in registration order.
    pub fn run_request_hooks(&self, url: &str, text: &str) -> String {
        let entries: Vec<Arc<RequestHookEntry>> = self.entries.read().clone();
        let mut current = text.to_string();

        for entry in entries {
            if !entry.enabled.load(Ordering::SeqCst) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if entry.matcher.matches(url, &self.location) {
                    (entry.transform)(&current).map(Some)
                } else {
                    Ok(None)
                }
            }));
            match outcome {
                Ok(Ok(Some(Some(next)))) if next != current => {
                    trace!("Request hook #{} rewrote {}", entry.id, url);
                    current = next;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("[RequestHook:transform] #{} {} failed: {:#}", entry.id, url, e),
                Err(_) => error!("[RequestHook:transform] #{} {} panicked", entry.id, url),
            }
        }

        current
    }

    /// Installs both network patch points. Idempotent.
    pub fn install(self: &Arc<Self>, realm: &Realm) -> Result<(), HookInstallError> {
        self.install_xhr(realm)?;
        self.install_fetch(realm)
    }

    /// Whether any patch point is installed.
    pub fn is_installed(&self) -> bool {
        !self.xhr_unhooks.lock().is_empty() || self.fetch_unhook.lock().is_some()
    }

    /// Hooks `XMLHttpRequest.prototype.open` and `send`. Idempotent.
    pub fn install_xhr(self: &Arc<Self>, realm: &Realm) -> Result<(), HookInstallError> {
        let mut unhooks = self.xhr_unhooks.lock();
        if !unhooks.is_empty() {
            return Ok(());
        }

        let open = realm.hook(
            slots::XHR_PROTO,
            "open",
            |args: XhrOpen, next: Next<XhrOpen, Result<(), NetworkError>>| {
                args.xhr.set_extension(XHR_URL_KEY, args.url.clone());
                next.call(args)
            },
        )?;

        let registry = Arc::downgrade(self);
        let send = match realm.hook(
            slots::XHR_PROTO,
            "send",
            move |args: XhrSend, next: Next<XhrSend, XhrSendFuture>| {
                if let Some(registry) = registry.upgrade() {
                    registry.watch_xhr(&args.xhr);
                }
                next.call(args)
            },
        ) {
            Ok(unhook) => unhook,
            Err(e) => {
                let _ = open.unhook();
                return Err(e);
            }
        };

        unhooks.push(open);
        unhooks.push(send);
        debug!("XMLHttpRequest hooks installed");
        Ok(())
    }

    /// Hooks `window.fetch`. Idempotent.
    pub fn install_fetch(self: &Arc<Self>, realm: &Realm) -> Result<(), HookInstallError> {
        let mut slot = self.fetch_unhook.lock();
        if slot.is_some() {
            return Ok(());
        }

        let registry = Arc::downgrade(self);
        let unhook = realm.hook(
            slots::WINDOW,
            "fetch",
            move |request: FetchRequest, next: Next<FetchRequest, FetchFuture>| -> FetchFuture {
                let registry = registry.clone();
                let url = request.url.clone();
                let pending = next.call(request);
                async move {
                    let response = pending.await?;
                    let Some(registry) = registry.upgrade() else {
                        return Ok(response);
                    };

                    let content_type = response.content_type().to_ascii_lowercase();
                    if !(content_type.contains("json") || content_type.starts_with("text/")) {
                        return Ok(response);
                    }

                    let rewritten = registry.run_request_hooks(&url, &response.body);
                    if rewritten == response.body {
                        return Ok(response);
                    }
                    if let Some(notifier) = &registry.notifier {
                        notifier.show(
                            RESPONSE_MODIFIED_TOAST,
                            ToastOptions::kind(ToastKind::Info).with_description(url.clone()),
                        );
                    }
                    Ok(response.with_body(rewritten))
                }
                .boxed()
            },
        )?;

        *slot = Some(unhook);
        debug!("fetch hook installed");
        Ok(())
    }

    /// Removes every network patch.
    pub fn uninstall(&self) {
        let unhooks = std::mem::take(&mut *self.xhr_unhooks.lock());
        for unhook in unhooks {
            let _ = unhook.unhook();
        }
        if let Some(unhook) = self.fetch_unhook.lock().take() {
            let _ = unhook.unhook();
        }
    }

    fn watch_xhr(self: &Arc<Self>, xhr: &Arc<XmlHttpRequest>) {
        let patched = Arc::new(AtomicBool::new(false));
        let target = Arc::downgrade(xhr);
        let registry = Arc::downgrade(self);

        let on_ready = Arc::new(move || {
            let (Some(xhr), Some(registry)) = (target.upgrade(), registry.upgrade()) else {
                return;
            };
            if xhr.ready_state() < XmlHttpRequest::LOADING || patched.load(Ordering::SeqCst) {
                return;
            }
            let raw = xhr.native_response_text();
            if raw.is_empty() {
                return;
            }
            patched.store(true, Ordering::SeqCst);

            let url = xhr.extension(XHR_URL_KEY).unwrap_or_default();
            let rewritten = registry.run_request_hooks(&url, &raw);
            if rewritten != raw {
                xhr.define_response_override(rewritten);
            }
        });

        let state_change = on_ready.clone();
        xhr.target().add_event_listener(
            "readystatechange",
            Listener::exempt(move |_| state_change()),
            ListenerOptions::default(),
        );
        xhr.target().add_event_listener(
            "load",
            Listener::exempt(move |_| on_ready()),
            ListenerOptions::default(),
        );
    }
}

impl fmt::Debug for RequestHookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHookRegistry")
            .field("origin", &self.location.origin())
            .field("hooks", &self.len())
            .field("installed", &self.is_installed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RequestHookRegistry {
        RequestHookRegistry::new(Location::new("https://lms.example.edu/course/1").unwrap())
    }

    fn flip(field: &'static str) -> TransformFn {
        json_transform(move |body| {
            if body[field] == Value::Bool(false) {
                body[field] = Value::Bool(true);
                return Ok(true);
            }
            Ok(false)
        })
    }

    #[test]
    fn test_path_matcher_is_same_origin_only() {
        let location = Location::new("https://lms.example.edu/").unwrap();
        let matcher = UrlMatcher::path(r"^/api/activities/\d+").unwrap();
        assert!(matcher.matches("/api/activities/7", &location));
        assert!(matcher.matches("https://lms.example.edu/api/activities/7", &location));
        assert!(!matcher.matches("https://cdn.example.com/api/activities/7", &location));
        assert!(!matcher.matches("/api/users/7", &location));
    }

    #[test]
    fn test_exact_and_predicate_matchers() {
        let location = Location::new("https://lms.example.edu/").unwrap();
        assert!(UrlMatcher::exact("/api/me").matches("/api/me", &location));
        assert!(UrlMatcher::exact("https://lms.example.edu/api/me").matches("/api/me", &location));
        assert!(UrlMatcher::predicate(|url| url.ends_with("?x=1")).matches("/a?x=1", &location));
    }

    #[test]
    fn test_hooks_chain_in_order() {
        let registry = registry();
        let _a = registry.register_request_hook(UrlMatcher::predicate(|_| true), flip("a"));
        let _b = registry.register_request_hook(UrlMatcher::predicate(|_| true), flip("b"));
        assert_eq!(
            registry.run_request_hooks("/x", r#"{"a":false,"b":false}"#),
            r#"{"a":true,"b":true}"#
        );
    }

    #[test]
    fn test_failing_hook_does_not_break_chain() {
        let registry = registry();
        let _broken = registry.register_request_hook(
            UrlMatcher::predicate(|_| true),
            Arc::new(|_: &str| -> anyhow::Result<Option<String>> { Err(anyhow::anyhow!("boom")) }),
        );
        let _panics = registry.register_request_hook(
            UrlMatcher::predicate(|_| true),
            Arc::new(|_: &str| -> anyhow::Result<Option<String>> { panic!("bug") }),
        );
        let _ok = registry.register_request_hook(UrlMatcher::predicate(|_| true), flip("a"));

        assert_eq!(registry.run_request_hooks("/x", r#"{"a":false}"#), r#"{"a":true}"#);
    }

    #[test]
    fn test_disabled_and_unregistered_hooks_are_skipped() {
        let registry = registry();
        let hook = registry.register_request_hook(UrlMatcher::predicate(|_| true), flip("a"));
        hook.disable();
        assert_eq!(registry.run_request_hooks("/x", r#"{"a":false}"#), r#"{"a":false}"#);
        hook.enable();
        assert!(hook.unregister());
        assert!(!hook.unregister());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_non_json_text_is_left_alone_by_json_transform() {
        let registry = registry();
        let _hook = registry.register_request_hook(UrlMatcher::predicate(|_| true), flip("a"));
        assert_eq!(registry.run_request_hooks("/x", "plain text"), "plain text");
    }
}
