//! Event-hook registry.
//!
//! Lets many independent features affect the same event type without each
//! of them overriding `addEventListener`. The registry hooks
//! `EventTarget.prototype.addEventListener` / `removeEventListener` once and
//! wraps newly registered listeners in a guard that swallows the event while
//! any enabled entry for that type asks for suppression.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use tronclass_enhancer::browser::{Event, Listener, ListenerOptions, Page, StaticTransport};
//! use tronclass_enhancer::hook::{EventHookRegistry, HookOptions};
//!
//! let page = Page::new("https://lms.example.edu/", Arc::new(StaticTransport::new())).unwrap();
//! let registry = Arc::new(EventHookRegistry::new());
//! registry.install(page.realm()).unwrap();
//!
//! let copy = registry.register_hook("copy", HookOptions::always());
//!
//! let fired = Arc::new(AtomicUsize::new(0));
//! let counter = fired.clone();
//! let document = page.document().target();
//! document.add_event_listener("copy", Listener::new(move |_| { counter.fetch_add(1, Ordering::SeqCst); }), ListenerOptions::default());
//!
//! document.dispatch_event(&Event::new("copy"));
//! assert_eq!(fired.load(Ordering::SeqCst), 0);
//!
//! copy.disable();
//! document.dispatch_event(&Event::new("copy"));
//! assert_eq!(fired.load(Ordering::SeqCst), 1);
//! ```

use crate::browser::event::{Event, EventTarget, Listener, ListenerCall, ListenerOptions, WeakListener};
use crate::hook::point::{Next, Unhook};
use crate::hook::realm::Realm;
use crate::hook::{slots, HookInstallError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Pre-registration predicate. Returning `false` lets the registration
/// through untouched.
pub type PreHookFn = Arc<dyn Fn(&ListenerCall) -> bool + Send + Sync>;

/// Pre-dispatch predicate. Returning `true` suppresses the event for
/// wrapped listeners.
pub type PreCallFn = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Options of a registered event hook.
#[derive(Clone)]
pub struct HookOptions {
    pre_hook: Option<PreHookFn>,
    pre_call: Option<PreCallFn>,
    enabled: bool,
}

impl HookOptions {
    /// Suppresses every wrapped listener while enabled.
    pub fn always() -> Self {
        Self {
            pre_hook: None,
            pre_call: None,
            enabled: true,
        }
    }

    /// Sets the pre-registration predicate.
    pub fn pre_hook<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ListenerCall) -> bool + Send + Sync + 'static,
    {
        self.pre_hook = Some(Arc::new(predicate));
        self
    }

    /// Sets the pre-dispatch predicate.
    pub fn pre_call<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.pre_call = Some(Arc::new(predicate));
        self
    }

    /// Registers the entry disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl Default for HookOptions {
    fn default() -> Self {
        Self::always()
    }
}

impl fmt::Debug for HookOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookOptions")
            .field("pre_hook", &self.pre_hook.is_some())
            .field("pre_call", &self.pre_call.is_some())
            .field("enabled", &self.enabled)
            .finish()
    }
}

struct EventHookEntry {
    event_type: String,
    pre_hook: Option<PreHookFn>,
    pre_call: Option<PreCallFn>,
    enabled: AtomicBool,
}

impl EventHookEntry {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// `Some(false)` is a veto. A panicking predicate has no opinion.
    fn pre_hook_verdict(&self, call: &ListenerCall) -> Option<bool> {
        let predicate = self.pre_hook.as_ref()?;
        match catch_unwind(AssertUnwindSafe(|| predicate(call))) {
            Ok(verdict) => Some(verdict),
            Err(_) => {
                warn!("[EventHook:preHook] {} predicate panicked", self.event_type);
                None
            }
        }
    }

    fn wants_suppression(&self, event: &Event) -> bool {
        match &self.pre_call {
            None => true,
            Some(predicate) => catch_unwind(AssertUnwindSafe(|| predicate(event)))
                .unwrap_or_else(|_| {
                    warn!("[EventHook:preCall] {} predicate panicked", self.event_type);
                    false
                }),
        }
    }
}

/// Handle that toggles one registered event hook.
#[derive(Clone)]
pub struct EventHookController {
    entry: Arc<EventHookEntry>,
}

impl EventHookController {
    /// Lets the entry contribute to suppression again.
    pub fn enable(&self) {
        self.entry.enabled.store(true, Ordering::SeqCst);
    }

    /// Stops the entry from contributing to suppression. The entry stays registered.
    pub fn disable(&self) {
        self.entry.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether the entry is enabled.
    pub fn is_enabled(&self) -> bool {
        self.entry.is_enabled()
    }

    /// Event type the entry applies to.
    pub fn event_type(&self) -> &str {
        &self.entry.event_type
    }
}

impl fmt::Debug for EventHookController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHookController")
            .field("event_type", &self.entry.event_type)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

struct GuardRecord {
    original: WeakListener,
    guard: WeakListener,
}

/// How [`EventHookRegistry::block_events`] stops an event at the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockStrategy {
    /// `stopPropagation()`
    #[default]
    Propagation,
    /// `stopImmediatePropagation()`
    Immediate,
    /// `preventDefault()`
    Prevent,
}

impl BlockStrategy {
    fn apply(self, event: &Event) {
        match self {
            BlockStrategy::Propagation => event.stop_propagation(),
            BlockStrategy::Immediate => event.stop_immediate_propagation(),
            BlockStrategy::Prevent => event.prevent_default(),
        }
    }
}

/// Handle returned by [`EventHookRegistry::block_events`].
#[must_use = "dropping BlockedEvents keeps the events blocked for the page lifetime"]
pub struct BlockedEvents {
    target: EventTarget,
    listeners: Vec<(String, Listener)>,
    controllers: Vec<EventHookController>,
}

impl BlockedEvents {
    /// Event types covered.
    pub fn event_types(&self) -> Vec<&str> {
        self.listeners.iter().map(|(t, _)| t.as_str()).collect()
    }

    /// Undoes the block: removes the capturing listeners, disables the hook
    /// entries and restores the `on<type>` properties.
    pub fn release(self) {
        for (event_type, listener) in &self.listeners {
            self.target
                .remove_event_listener(event_type, listener, ListenerOptions::capture());
            self.target.unblock_handler(event_type);
        }
        for controller in &self.controllers {
            controller.disable();
        }
        debug!(
            "Released {} blocked events on {}",
            self.listeners.len(),
            self.target.label()
        );
    }
}

impl fmt::Debug for BlockedEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockedEvents")
            .field("target", &self.target.label())
            .field("event_types", &self.event_types())
            .finish()
    }
}

/// Redefines `on<type>` on `target` so reads return nothing and assignments
/// are discarded.
pub fn define_blocked_handler(target: &EventTarget, event_type: &str) {
    target.block_handler(event_type);
}

/// Registry of event hooks, installed once over `addEventListener`.
#[derive(Default)]
pub struct EventHookRegistry {
    entries: RwLock<HashMap<String, Vec<Arc<EventHookEntry>>>>,
    guards: Mutex<HashMap<(usize, String), GuardRecord>>,
    unhooks: Mutex<Vec<Unhook>>,
}

impl EventHookRegistry {
    /// Creates an empty, uninstalled registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks `addEventListener` and `removeEventListener`. Idempotent.
    pub fn install(self: &Arc<Self>, realm: &Realm) -> Result<(), HookInstallError> {
        let mut unhooks = self.unhooks.lock();
        if !unhooks.is_empty() {
            return Ok(());
        }

        let registry = Arc::downgrade(self);
        let add = realm.hook(
            slots::EVENT_TARGET_PROTO,
            "addEventListener",
            move |call: ListenerCall, next: Next<ListenerCall, ()>| match registry.upgrade() {
                Some(registry) => next.call(registry.wrap_registration(call)),
                None => next.call(call),
            },
        )?;

        let registry = Arc::downgrade(self);
        let remove = match realm.hook(
            slots::EVENT_TARGET_PROTO,
            "removeEventListener",
            move |call: ListenerCall, next: Next<ListenerCall, ()>| match registry.upgrade() {
                Some(registry) => next.call(registry.substitute_guard(call)),
                None => next.call(call),
            },
        ) {
            Ok(unhook) => unhook,
            Err(e) => {
                let _ = add.unhook();
                return Err(e);
            }
        };

        unhooks.push(add);
        unhooks.push(remove);
        debug!("Event-hook registry installed");
        Ok(())
    }

    /// Whether the registry currently hooks the realm.
    pub fn is_installed(&self) -> bool {
        !self.unhooks.lock().is_empty()
    }

    /// Removes the `addEventListener` / `removeEventListener` hooks.
    ///
    /// Already wrapped listeners keep their guards.
    pub fn uninstall(&self) {
        let unhooks = std::mem::take(&mut *self.unhooks.lock());
        for unhook in unhooks {
            let _ = unhook.unhook();
        }
    }

    /// Registers an event hook for `event_type`.
    pub fn register_hook(&self, event_type: &str, options: HookOptions) -> EventHookController {
        let entry = Arc::new(EventHookEntry {
            event_type: event_type.to_string(),
            pre_hook: options.pre_hook,
            pre_call: options.pre_call,
            enabled: AtomicBool::new(options.enabled),
        });
        self.entries
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push(entry.clone());
        trace!("Registered event hook for {}", event_type);
        EventHookController { entry }
    }

    /// Number of entries registered for a type, enabled or not.
    pub fn hook_count(&self, event_type: &str) -> usize {
        self.entries
            .read()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Whether a wrapped listener would be suppressed for `event` right now.
    pub fn should_suppress(&self, event: &Event) -> bool {
        self.entries_for(event.event_type())
            .iter()
            .filter(|entry| entry.is_enabled())
            .any(|entry| entry.wants_suppression(event))
    }

    /// Blocks a batch of event types on `target`.
    ///
    /// For every type this registers an always-suppress hook entry, attaches a
    /// hook-exempt capturing listener applying `strategy`, and blocks the
    /// inline `on<type>` handler.
    pub fn block_events(
        &self,
        event_types: &[&str],
        target: &EventTarget,
        strategy: BlockStrategy,
    ) -> BlockedEvents {
        let mut listeners = Vec::with_capacity(event_types.len());
        let mut controllers = Vec::with_capacity(event_types.len());

        for event_type in event_types {
            define_blocked_handler(target, event_type);
            let listener = Listener::exempt(move |event| strategy.apply(event));
            target.add_event_listener(event_type, listener.clone(), ListenerOptions::capture());
            listeners.push((event_type.to_string(), listener));
            controllers.push(self.register_hook(event_type, HookOptions::always()));
        }

        debug!(
            "Blocked {:?} on {} ({:?})",
            event_types,
            target.label(),
            strategy
        );
        BlockedEvents {
            target: target.clone(),
            listeners,
            controllers,
        }
    }

    fn entries_for(&self, event_type: &str) -> Vec<Arc<EventHookEntry>> {
        self.entries
            .read()
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    fn wrap_registration(self: &Arc<Self>, mut call: ListenerCall) -> ListenerCall {
        let Some(listener) = call.listener.clone() else {
            return call;
        };
        if listener.is_exempt() {
            return call;
        }

        let entries = self.entries_for(&call.event_type);
        if entries.is_empty() {
            return call;
        }
        let vetoed = entries
            .iter()
            .filter(|entry| entry.is_enabled())
            .any(|entry| entry.pre_hook_verdict(&call) == Some(false));
        if vetoed {
            trace!("{} listener on {} passed through", call.event_type, call.target.label());
            return call;
        }

        call.listener = Some(self.guard_for(&listener, &call.event_type));
        call
    }

    fn substitute_guard(&self, mut call: ListenerCall) -> ListenerCall {
        if let Some(listener) = &call.listener {
            if !listener.is_exempt() {
                if let Some(guard) = self.existing_guard(listener, &call.event_type) {
                    call.listener = Some(guard);
                }
            }
        }
        call
    }

    fn existing_guard(&self, listener: &Listener, event_type: &str) -> Option<Listener> {
        let guards = self.guards.lock();
        let record = guards.get(&(listener.identity(), event_type.to_string()))?;
        let original = record.original.upgrade()?;
        if !original.ptr_eq(listener) {
            return None;
        }
        record.guard.upgrade()
    }

    fn guard_for(self: &Arc<Self>, listener: &Listener, event_type: &str) -> Listener {
        if let Some(guard) = self.existing_guard(listener, event_type) {
            return guard;
        }

        let registry: Weak<Self> = Arc::downgrade(self);
        let original = listener.clone();
        let guard = Listener::exempt(move |event| {
            let suppress = registry
                .upgrade()
                .map(|registry| registry.should_suppress(event))
                .unwrap_or(false);
            if suppress {
                trace!("Suppressed {} for a hooked listener", event.event_type());
                return;
            }
            original.invoke(event);
        });

        let mut guards = self.guards.lock();
        guards.retain(|_, record| record.original.is_alive() && record.guard.is_alive());
        guards.insert(
            (listener.identity(), event_type.to_string()),
            GuardRecord {
                original: listener.downgrade(),
                guard: guard.downgrade(),
            },
        );
        guard
    }
}

impl fmt::Debug for EventHookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        let mut types: Vec<&String> = entries.keys().collect();
        types.sort();
        f.debug_struct("EventHookRegistry")
            .field("types", &types)
            .field("installed", &self.is_installed())
            .finish()
    }
}
