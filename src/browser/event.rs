//! Event targets and dispatch.
//!
//! Listener registration goes through the shared `EventTarget.prototype`
//! hook points so the interception layer sees every `addEventListener` call.
//! Dispatch follows the DOM order: capture listeners from the root down,
//! target listeners and the inline `on<type>` handler, then bubbling listeners.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use tronclass_enhancer::browser::{Event, EventTarget, EventTargetProto, Listener, ListenerOptions, TargetKind};
//!
//! let proto = Arc::new(EventTargetProto::new());
//! let target = EventTarget::new(TargetKind::Document, "document", proto);
//! let hits = Arc::new(AtomicUsize::new(0));
//! let counter = hits.clone();
//! target.add_event_listener("copy", Listener::new(move |_| { counter.fetch_add(1, Ordering::SeqCst); }), ListenerOptions::default());
//!
//! target.dispatch_event(&Event::new("copy"));
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! ```

use crate::hook::point::HookPoint;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Phase of an event being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventPhase {
    /// Not being dispatched.
    None = 0,
    /// Travelling from the root towards the target.
    Capturing = 1,
    /// At the target.
    AtTarget = 2,
    /// Travelling back up to the root.
    Bubbling = 3,
}

impl EventPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Capturing,
            2 => Self::AtTarget,
            3 => Self::Bubbling,
            _ => Self::None,
        }
    }
}

/// Modifier keys held during a keyboard event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyModifiers {
    /// Control
    pub ctrl: bool,
    /// Shift
    pub shift: bool,
    /// Alt / Option
    pub alt: bool,
    /// Meta / Command
    pub meta: bool,
}

/// A dispatched event.
pub struct Event {
    event_type: String,
    bubbles: bool,
    cancelable: bool,
    detail: serde_json::Value,
    propagation_stopped: AtomicBool,
    immediate_stopped: AtomicBool,
    default_prevented: AtomicBool,
    phase: AtomicU8,
}

impl Event {
    /// Creates a bubbling, cancelable event.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            bubbles: true,
            cancelable: true,
            detail: serde_json::Value::Null,
            propagation_stopped: AtomicBool::new(false),
            immediate_stopped: AtomicBool::new(false),
            default_prevented: AtomicBool::new(false),
            phase: AtomicU8::new(EventPhase::None as u8),
        }
    }

    /// Creates an event that does not bubble (`focus`, `load`, ...).
    pub fn non_bubbling(event_type: impl Into<String>) -> Self {
        Self {
            bubbles: false,
            ..Self::new(event_type)
        }
    }

    /// Attaches a detail payload.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    /// Creates a keyboard event carrying `key` and its modifiers in the detail.
    pub fn keyboard(event_type: impl Into<String>, key: &str, modifiers: KeyModifiers) -> Self {
        Self::new(event_type).with_detail(serde_json::json!({
            "key": key,
            "ctrlKey": modifiers.ctrl,
            "shiftKey": modifiers.shift,
            "altKey": modifiers.alt,
            "metaKey": modifiers.meta,
        }))
    }

    /// `KeyboardEvent.key`, if this is a keyboard event.
    pub fn key(&self) -> Option<&str> {
        self.detail.get("key").and_then(|k| k.as_str())
    }

    /// Modifier state of a keyboard event.
    pub fn modifiers(&self) -> KeyModifiers {
        let flag = |name: &str| self.detail.get(name).and_then(|v| v.as_bool()).unwrap_or(false);
        KeyModifiers {
            ctrl: flag("ctrlKey"),
            shift: flag("shiftKey"),
            alt: flag("altKey"),
            meta: flag("metaKey"),
        }
    }

    /// Event type.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Whether the event bubbles.
    pub fn bubbles(&self) -> bool {
        self.bubbles
    }

    /// Detail payload.
    pub fn detail(&self) -> &serde_json::Value {
        &self.detail
    }

    /// Current dispatch phase.
    pub fn phase(&self) -> EventPhase {
        EventPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// `event.stopPropagation()`
    pub fn stop_propagation(&self) {
        self.propagation_stopped.store(true, Ordering::SeqCst);
    }

    /// `event.stopImmediatePropagation()`
    pub fn stop_immediate_propagation(&self) {
        self.propagation_stopped.store(true, Ordering::SeqCst);
        self.immediate_stopped.store(true, Ordering::SeqCst);
    }

    /// `event.preventDefault()`
    pub fn prevent_default(&self) {
        if self.cancelable {
            self.default_prevented.store(true, Ordering::SeqCst);
        }
    }

    /// Whether propagation was stopped.
    pub fn propagation_stopped(&self) -> bool {
        self.propagation_stopped.load(Ordering::SeqCst)
    }

    /// Whether default handling was prevented.
    pub fn default_prevented(&self) -> bool {
        self.default_prevented.load(Ordering::SeqCst)
    }

    fn immediate_stopped(&self) -> bool {
        self.immediate_stopped.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: EventPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("type", &self.event_type)
            .field("phase", &self.phase())
            .field("propagation_stopped", &self.propagation_stopped())
            .field("default_prevented", &self.default_prevented())
            .finish()
    }
}

struct ListenerInner {
    callback: Box<dyn Fn(&Event) + Send + Sync>,
    exempt: bool,
}

/// An event listener. Identity is reference identity, as in the DOM.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    /// Creates a listener.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ListenerInner {
                callback: Box::new(callback),
                exempt: false,
            }),
        }
    }

    /// Creates a listener the event-hook registry never wraps.
    ///
    /// Used for the crate's own listeners.
    pub fn exempt<F>(callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ListenerInner {
                callback: Box::new(callback),
                exempt: true,
            }),
        }
    }

    /// Whether the listener is hook-exempt.
    pub fn is_exempt(&self) -> bool {
        self.inner.exempt
    }

    /// Invokes the listener.
    pub fn invoke(&self, event: &Event) {
        (self.inner.callback)(event)
    }

    /// Reference identity comparison.
    pub fn ptr_eq(&self, other: &Listener) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stable address used as an identity key while the listener is alive.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Weak reference to the listener.
    pub fn downgrade(&self) -> WeakListener {
        WeakListener(Arc::downgrade(&self.inner))
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("identity", &format_args!("{:#x}", self.identity()))
            .field("exempt", &self.inner.exempt)
            .finish()
    }
}

/// Weak counterpart of [`Listener`].
#[derive(Clone)]
pub struct WeakListener(Weak<ListenerInner>);

impl WeakListener {
    /// Upgrades to a live listener.
    pub fn upgrade(&self) -> Option<Listener> {
        self.0.upgrade().map(|inner| Listener { inner })
    }

    /// Whether the listener is still alive.
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// `addEventListener` options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    /// Register for the capture phase.
    pub capture: bool,
    /// Remove after the first invocation.
    pub once: bool,
    /// Declares that the listener never calls `preventDefault`.
    pub passive: bool,
}

impl ListenerOptions {
    /// Capture-phase options.
    pub fn capture() -> Self {
        Self {
            capture: true,
            ..Default::default()
        }
    }

    /// One-shot options.
    pub fn once() -> Self {
        Self {
            once: true,
            ..Default::default()
        }
    }
}

/// Kind of an event target, the `instanceof` of the page model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    /// `window`
    Window,
    /// `document`
    Document,
    /// An element.
    Element,
    /// An `XMLHttpRequest`.
    XmlHttpRequest,
}

/// Arguments of an `addEventListener` / `removeEventListener` call.
#[derive(Clone)]
pub struct ListenerCall {
    /// Receiver of the call (`this`).
    pub target: EventTarget,
    /// Event type.
    pub event_type: String,
    /// Listener, `None` for `addEventListener(type, null)`.
    pub listener: Option<Listener>,
    /// Options.
    pub options: ListenerOptions,
}

impl fmt::Debug for ListenerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerCall")
            .field("target", &self.target.label())
            .field("event_type", &self.event_type)
            .field("listener", &self.listener)
            .field("options", &self.options)
            .finish()
    }
}

/// Shared `EventTarget.prototype` methods.
pub struct EventTargetProto {
    /// `EventTarget.prototype.addEventListener`
    pub add_event_listener: Arc<HookPoint<ListenerCall, ()>>,
    /// `EventTarget.prototype.removeEventListener`
    pub remove_event_listener: Arc<HookPoint<ListenerCall, ()>>,
}

impl EventTargetProto {
    /// Creates the prototype with native registration semantics.
    pub fn new() -> Self {
        Self {
            add_event_listener: Arc::new(HookPoint::native(
                "addEventListener",
                |call: ListenerCall| {
                    if let Some(listener) = call.listener {
                        call.target.attach(&call.event_type, listener, call.options);
                    }
                },
            )),
            remove_event_listener: Arc::new(HookPoint::native(
                "removeEventListener",
                |call: ListenerCall| {
                    if let Some(listener) = call.listener {
                        call.target
                            .detach(&call.event_type, &listener, call.options.capture);
                    }
                },
            )),
        }
    }
}

impl Default for EventTargetProto {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct Registration {
    event_type: String,
    listener: Listener,
    capture: bool,
    once: bool,
}

struct TargetInner {
    kind: TargetKind,
    label: String,
    parent: RwLock<Option<Weak<TargetInner>>>,
    registrations: RwLock<Vec<Registration>>,
    handlers: RwLock<HashMap<String, Listener>>,
    blocked_handlers: RwLock<HashSet<String>>,
    proto: Arc<EventTargetProto>,
}

/// An event target (window, document, element or XHR).
#[derive(Clone)]
pub struct EventTarget {
    inner: Arc<TargetInner>,
}

impl EventTarget {
    /// Creates a detached target.
    pub fn new(kind: TargetKind, label: impl Into<String>, proto: Arc<EventTargetProto>) -> Self {
        Self {
            inner: Arc::new(TargetInner {
                kind,
                label: label.into(),
                parent: RwLock::new(None),
                registrations: RwLock::new(Vec::new()),
                handlers: RwLock::new(HashMap::new()),
                blocked_handlers: RwLock::new(HashSet::new()),
                proto,
            }),
        }
    }

    /// Kind of the target.
    pub fn kind(&self) -> TargetKind {
        self.inner.kind
    }

    /// Human-readable label.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Reference identity comparison.
    pub fn ptr_eq(&self, other: &EventTarget) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Sets the propagation parent.
    pub fn set_parent(&self, parent: Option<&EventTarget>) {
        *self.inner.parent.write() = parent.map(|p| Arc::downgrade(&p.inner));
    }

    /// Propagation parent, if still alive.
    pub fn parent(&self) -> Option<EventTarget> {
        self.inner
            .parent
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| EventTarget { inner })
    }

    /// `addEventListener`, routed through the prototype hook point.
    pub fn add_event_listener(
        &self,
        event_type: &str,
        listener: impl Into<Option<Listener>>,
        options: ListenerOptions,
    ) {
        self.inner.proto.add_event_listener.call(ListenerCall {
            target: self.clone(),
            event_type: event_type.to_string(),
            listener: listener.into(),
            options,
        });
    }

    /// `removeEventListener`, routed through the prototype hook point.
    pub fn remove_event_listener(&self, event_type: &str, listener: &Listener, options: ListenerOptions) {
        self.inner.proto.remove_event_listener.call(ListenerCall {
            target: self.clone(),
            event_type: event_type.to_string(),
            listener: Some(listener.clone()),
            options,
        });
    }

    /// Number of registered listeners for a type.
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.inner
            .registrations
            .read()
            .iter()
            .filter(|r| r.event_type == event_type)
            .count()
    }

    /// Whether exactly this listener is registered for the type.
    pub fn has_listener(&self, event_type: &str, listener: &Listener) -> bool {
        self.inner
            .registrations
            .read()
            .iter()
            .any(|r| r.event_type == event_type && r.listener.ptr_eq(listener))
    }

    /// Assigns the inline `on<type>` handler.
    ///
    /// Discarded when the handler property has been blocked.
    pub fn set_handler(&self, event_type: &str, handler: Option<Listener>) {
        if self.is_handler_blocked(event_type) {
            debug!(
                "[blockEvents] Prevented assignment to on{} of {}",
                event_type, self.inner.label
            );
            return;
        }
        let mut handlers = self.inner.handlers.write();
        match handler {
            Some(handler) => {
                handlers.insert(event_type.to_string(), handler);
            }
            None => {
                handlers.remove(event_type);
            }
        }
    }

    /// Reads the inline `on<type>` handler. Blocked handlers read as `None`.
    pub fn handler(&self, event_type: &str) -> Option<Listener> {
        if self.is_handler_blocked(event_type) {
            return None;
        }
        self.inner.handlers.read().get(event_type).cloned()
    }

    /// Redefines `on<type>` so that reads return nothing and assignments are
    /// silently discarded.
    pub fn block_handler(&self, event_type: &str) {
        self.inner.handlers.write().remove(event_type);
        self.inner
            .blocked_handlers
            .write()
            .insert(event_type.to_string());
    }

    /// Restores a plain `on<type>` property.
    pub fn unblock_handler(&self, event_type: &str) {
        self.inner.blocked_handlers.write().remove(event_type);
    }

    /// Whether `on<type>` is blocked.
    pub fn is_handler_blocked(&self, event_type: &str) -> bool {
        self.inner.blocked_handlers.read().contains(event_type)
    }

    /// Dispatches an event through the propagation path.
    ///
    /// Returns `false` if a listener called `preventDefault`.
    pub fn dispatch_event(&self, event: &Event) -> bool {
        let mut ancestors = Vec::new();
        let mut current = self.parent();
        while let Some(target) = current {
            current = target.parent();
            ancestors.push(target);
        }

        trace!(
            "Dispatching {} on {} ({} ancestors)",
            event.event_type(),
            self.label(),
            ancestors.len()
        );

        event.set_phase(EventPhase::Capturing);
        for target in ancestors.iter().rev() {
            target.invoke(event, EventPhase::Capturing);
            if event.propagation_stopped() {
                event.set_phase(EventPhase::None);
                return !event.default_prevented();
            }
        }

        event.set_phase(EventPhase::AtTarget);
        self.invoke(event, EventPhase::AtTarget);

        if event.bubbles() && !event.propagation_stopped() {
            event.set_phase(EventPhase::Bubbling);
            for target in ancestors.iter() {
                target.invoke(event, EventPhase::Bubbling);
                if event.propagation_stopped() {
                    break;
                }
            }
        }

        event.set_phase(EventPhase::None);
        !event.default_prevented()
    }

    pub(crate) fn attach(&self, event_type: &str, listener: Listener, options: ListenerOptions) {
        let mut registrations = self.inner.registrations.write();
        let duplicate = registrations.iter().any(|r| {
            r.event_type == event_type && r.capture == options.capture && r.listener.ptr_eq(&listener)
        });
        if !duplicate {
            registrations.push(Registration {
                event_type: event_type.to_string(),
                listener,
                capture: options.capture,
                once: options.once,
            });
        }
    }

    pub(crate) fn detach(&self, event_type: &str, listener: &Listener, capture: bool) {
        self.inner.registrations.write().retain(|r| {
            !(r.event_type == event_type && r.capture == capture && r.listener.ptr_eq(listener))
        });
    }

    fn invoke(&self, event: &Event, phase: EventPhase) {
        let matching: Vec<Registration> = self
            .inner
            .registrations
            .read()
            .iter()
            .filter(|r| {
                r.event_type == event.event_type()
                    && match phase {
                        EventPhase::Capturing => r.capture,
                        EventPhase::Bubbling => !r.capture,
                        _ => true,
                    }
            })
            .cloned()
            .collect();

        for registration in matching {
            if registration.once {
                self.detach(&registration.event_type, &registration.listener, registration.capture);
            }
            registration.listener.invoke(event);
            if event.immediate_stopped() {
                return;
            }
        }

        if phase != EventPhase::Capturing {
            if let Some(handler) = self.handler(event.event_type()) {
                handler.invoke(event);
            }
        }
    }
}

impl fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTarget")
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("registrations", &self.inner.registrations.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn tree() -> (EventTarget, EventTarget, EventTarget) {
        let proto = Arc::new(EventTargetProto::new());
        let window = EventTarget::new(TargetKind::Window, "window", proto.clone());
        let document = EventTarget::new(TargetKind::Document, "document", proto.clone());
        let element = EventTarget::new(TargetKind::Element, "div", proto);
        document.set_parent(Some(&window));
        element.set_parent(Some(&document));
        (window, document, element)
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Listener {
        let log = log.clone();
        Listener::new(move |_| log.lock().push(name))
    }

    #[test]
    fn test_capture_target_bubble_order() {
        let (window, document, element) = tree();
        let log = Arc::new(Mutex::new(Vec::new()));

        window.add_event_listener("click", recorder(&log, "window-capture"), ListenerOptions::capture());
        window.add_event_listener("click", recorder(&log, "window-bubble"), ListenerOptions::default());
        document.add_event_listener("click", recorder(&log, "document-bubble"), ListenerOptions::default());
        element.add_event_listener("click", recorder(&log, "element"), ListenerOptions::default());
        element.set_handler("click", Some(recorder(&log, "onclick")));

        element.dispatch_event(&Event::new("click"));

        assert_eq!(
            *log.lock(),
            vec!["window-capture", "element", "onclick", "document-bubble", "window-bubble"]
        );
    }

    #[test]
    fn test_capturing_stop_propagation_shields_target() {
        let (window, _document, element) = tree();
        let log = Arc::new(Mutex::new(Vec::new()));

        window.add_event_listener("copy", Listener::new(|e| e.stop_propagation()), ListenerOptions::capture());
        element.add_event_listener("copy", recorder(&log, "element"), ListenerOptions::default());

        element.dispatch_event(&Event::new("copy"));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_stop_immediate_skips_remaining_listeners() {
        let (_window, document, _element) = tree();
        let log = Arc::new(Mutex::new(Vec::new()));

        document.add_event_listener(
            "blur",
            Listener::new(|e| e.stop_immediate_propagation()),
            ListenerOptions::default(),
        );
        document.add_event_listener("blur", recorder(&log, "second"), ListenerOptions::default());

        document.dispatch_event(&Event::new("blur"));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_once_and_duplicate_registration() {
        let (_window, document, _element) = tree();
        let log = Arc::new(Mutex::new(Vec::new()));
        let listener = recorder(&log, "hit");

        document.add_event_listener("load", listener.clone(), ListenerOptions::default());
        document.add_event_listener("load", listener.clone(), ListenerOptions::default());
        assert_eq!(document.listener_count("load"), 1);

        let once = recorder(&log, "once");
        document.add_event_listener("load", once, ListenerOptions::once());
        document.dispatch_event(&Event::new("load"));
        document.dispatch_event(&Event::new("load"));

        assert_eq!(*log.lock(), vec!["hit", "once", "hit"]);

        document.remove_event_listener("load", &listener, ListenerOptions::default());
        assert_eq!(document.listener_count("load"), 0);
    }

    #[test]
    fn test_blocked_handler_discards_assignment() {
        let (window, _document, _element) = tree();
        let log = Arc::new(Mutex::new(Vec::new()));

        window.block_handler("blur");
        window.set_handler("blur", Some(recorder(&log, "onblur")));
        assert!(window.handler("blur").is_none());

        window.dispatch_event(&Event::new("blur"));
        assert!(log.lock().is_empty());

        window.unblock_handler("blur");
        window.set_handler("blur", Some(recorder(&log, "onblur")));
        window.dispatch_event(&Event::new("blur"));
        assert_eq!(*log.lock(), vec!["onblur"]);
    }

    #[test]
    fn test_prevent_default_result() {
        let (_window, document, _element) = tree();
        document.add_event_listener(
            "contextmenu",
            Listener::new(|e| e.prevent_default()),
            ListenerOptions::default(),
        );
        assert!(!document.dispatch_event(&Event::new("contextmenu")));
    }
}
