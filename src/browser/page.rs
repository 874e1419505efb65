//! The page runtime.
//!
//! A [`Page`] wires together every built-in the interception layer patches:
//! the event-target prototype, `XMLHttpRequest`, `fetch`, `console`, the
//! `Function` constructor, `requestAnimationFrame` and the document's
//! visibility/focus accessors. All of them are registered as slots in the
//! page [`Realm`], and a [`NativeVault`] is captured right after, before any
//! hook can be installed.

use crate::browser::console::Console;
use crate::browser::dom::{Document, PageDom};
use crate::browser::event::{Event, EventTarget, EventTargetProto, TargetKind};
use crate::browser::location::{History, Location, RouteInfo};
use crate::browser::network::{
    native_fetch, FetchFuture, FetchRequest, NetworkError, Transport, XhrProto, XmlHttpRequest,
};
use crate::hook::point::HookPoint;
use crate::hook::realm::{Realm, Slot};
use crate::hook::slots;
use crate::hook::vault::NativeVault;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Callback passed to `requestAnimationFrame`.
pub type FrameCallback = Box<dyn FnOnce(Option<f64>) + Send>;

/// Arguments of `Function(...)` / `new Function(...)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionCall {
    /// Parameter names followed by the body, as in JavaScript.
    pub args: Vec<String>,
}

impl FunctionCall {
    /// Creates a call from its string arguments.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// A function compiled by the `Function` constructor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptFunction {
    /// Parameter names.
    pub params: Vec<String>,
    /// Body source.
    pub body: String,
}

impl ScriptFunction {
    fn compile(call: FunctionCall) -> Self {
        let mut args = call.args;
        let body = args.pop().unwrap_or_default();
        Self { params: args, body }
    }

    /// Whether the body is nothing but a `debugger` statement.
    pub fn is_debugger_trap(&self) -> bool {
        is_debugger_source(&self.body)
    }
}

/// `code.replace(/\s|;/g, "") === "debugger"`
pub fn is_debugger_source(code: &str) -> bool {
    let stripped: String = code
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ';')
        .collect();
    stripped == "debugger"
}

/// Built-in functions of the page global object.
struct WindowBuiltins {
    fetch: Arc<HookPoint<FetchRequest, FetchFuture>>,
    function: Arc<HookPoint<FunctionCall, ScriptFunction>>,
    request_animation_frame: Arc<HookPoint<FrameCallback, u64>>,
}

/// `Document.prototype` visibility and focus surface.
struct DocumentBuiltins {
    hidden: Arc<HookPoint<(), bool>>,
    visibility_state: Arc<HookPoint<(), String>>,
    has_focus: Arc<HookPoint<(), bool>>,
}

struct NativeDocumentState {
    hidden: AtomicBool,
    focused: AtomicBool,
}

/// One loaded page.
pub struct Page {
    realm: Realm,
    vault: Arc<NativeVault>,
    listener_proto: Arc<EventTargetProto>,
    xhr_proto: Arc<XhrProto>,
    transport: Arc<dyn Transport>,
    window: EventTarget,
    document: Arc<Document>,
    dom: Arc<PageDom>,
    location: Location,
    history: History,
    console: Console,
    window_builtins: WindowBuiltins,
    document_builtins: DocumentBuiltins,
    native_state: Arc<NativeDocumentState>,
    frames: Arc<Mutex<Vec<(u64, FrameCallback)>>>,
}

impl Page {
    /// Loads a page at `url`, served by `transport`.
    pub fn new(url: &str, transport: Arc<dyn Transport>) -> Result<Arc<Self>, NetworkError> {
        let location = Location::new(url)?;
        let listener_proto = Arc::new(EventTargetProto::new());
        let xhr_proto = Arc::new(XhrProto::new());

        let window = EventTarget::new(TargetKind::Window, "window", listener_proto.clone());
        let document_target =
            EventTarget::new(TargetKind::Document, "document", listener_proto.clone());
        document_target.set_parent(Some(&window));
        let document = Arc::new(Document::new(document_target, listener_proto.clone()));
        let dom = Arc::new(PageDom::new(document.clone()));
        let history = History::new(location.clone(), window.clone());
        let console = Console::new();

        let frames: Arc<Mutex<Vec<(u64, FrameCallback)>>> = Arc::new(Mutex::new(Vec::new()));
        let frame_ids = Arc::new(AtomicU64::new(1));
        let queue = frames.clone();
        let window_builtins = WindowBuiltins {
            fetch: Arc::new(native_fetch(location.clone(), transport.clone())),
            function: Arc::new(
                HookPoint::native("Function", ScriptFunction::compile)
                    .with_constructor(ScriptFunction::compile),
            ),
            request_animation_frame: Arc::new(HookPoint::native(
                "requestAnimationFrame",
                move |callback: FrameCallback| {
                    let id = frame_ids.fetch_add(1, Ordering::Relaxed);
                    queue.lock().push((id, callback));
                    id
                },
            )),
        };

        let native_state = Arc::new(NativeDocumentState {
            hidden: AtomicBool::new(false),
            focused: AtomicBool::new(true),
        });
        let hidden_state = native_state.clone();
        let visibility_state = native_state.clone();
        let focus_state = native_state.clone();
        let document_builtins = DocumentBuiltins {
            hidden: Arc::new(HookPoint::native("get hidden", move |_: ()| {
                hidden_state.hidden.load(Ordering::SeqCst)
            })),
            visibility_state: Arc::new(HookPoint::native("get visibilityState", move |_: ()| {
                if visibility_state.hidden.load(Ordering::SeqCst) {
                    "hidden".to_string()
                } else {
                    "visible".to_string()
                }
            })),
            has_focus: Arc::new(HookPoint::native("hasFocus", move |_: ()| {
                focus_state.focused.load(Ordering::SeqCst)
            })),
        };

        let realm = Realm::new();
        realm.define_method(
            slots::EVENT_TARGET_PROTO,
            "addEventListener",
            listener_proto.add_event_listener.clone(),
        );
        realm.define_method(
            slots::EVENT_TARGET_PROTO,
            "removeEventListener",
            listener_proto.remove_event_listener.clone(),
        );
        realm.define_method(slots::XHR_PROTO, "open", xhr_proto.open.clone());
        realm.define_method(slots::XHR_PROTO, "send", xhr_proto.send.clone());
        realm.define_method(slots::WINDOW, "fetch", window_builtins.fetch.clone());
        realm.define_method(slots::WINDOW, "Function", window_builtins.function.clone());
        realm.define_method(
            slots::WINDOW,
            "requestAnimationFrame",
            window_builtins.request_animation_frame.clone(),
        );
        realm.define_method(slots::CONSOLE, "log", console.log.clone());
        realm.define_method(slots::CONSOLE, "table", console.table.clone());
        realm.define_method(slots::CONSOLE, "clear", console.clear.clone());
        realm.define_method(
            slots::DOCUMENT_PROTO,
            "hasFocus",
            document_builtins.has_focus.clone(),
        );
        realm.define_accessor(slots::DOCUMENT_PROTO, "hidden", document_builtins.hidden.clone());
        realm.define_accessor(
            slots::DOCUMENT_PROTO,
            "visibilityState",
            document_builtins.visibility_state.clone(),
        );
        realm.define_data("navigator", "language", Value::String("zh-TW".to_string()));
        realm.define_data("navigator", "platform", Value::String("Win32".to_string()));

        let vault = Arc::new(NativeVault::capture(&realm));
        debug!("Loaded {} ({} natives captured)", location.href(), vault.len());

        Ok(Arc::new(Self {
            realm,
            vault,
            listener_proto,
            xhr_proto,
            transport,
            window,
            document,
            dom,
            location,
            history,
            console,
            window_builtins,
            document_builtins,
            native_state,
            frames,
        }))
    }

    /// Property slots of the page's globals.
    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    /// Natives captured at load.
    pub fn vault(&self) -> Arc<NativeVault> {
        self.vault.clone()
    }

    /// `window`
    pub fn window(&self) -> &EventTarget {
        &self.window
    }

    /// `document`
    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    /// DOM helpers bound to this document.
    pub fn dom(&self) -> Arc<PageDom> {
        self.dom.clone()
    }

    /// `location`
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// `history`
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Current route.
    pub fn route(&self) -> RouteInfo {
        self.location.route()
    }

    /// `console`
    pub fn console(&self) -> &Console {
        &self.console
    }

    /// `navigator.language`
    pub fn navigator_language(&self) -> String {
        match self.realm.slot("navigator", "language") {
            Some(Slot::Data(Value::String(language))) => language,
            _ => String::new(),
        }
    }

    /// Sets `navigator.language`.
    pub fn set_navigator_language(&self, language: &str) {
        self.realm
            .define_data("navigator", "language", Value::String(language.to_string()));
    }

    /// `navigator.platform`
    pub fn navigator_platform(&self) -> String {
        match self.realm.slot("navigator", "platform") {
            Some(Slot::Data(Value::String(platform))) => platform,
            _ => String::new(),
        }
    }

    /// Whether the page reports a macOS platform.
    pub fn is_mac(&self) -> bool {
        self.navigator_platform().starts_with("Mac")
    }

    /// `fetch(request)` through the `window.fetch` hook point.
    pub fn fetch(&self, request: FetchRequest) -> FetchFuture {
        self.window_builtins.fetch.call(request)
    }

    /// `new XMLHttpRequest()`
    pub fn xhr(&self) -> Arc<XmlHttpRequest> {
        XmlHttpRequest::new(
            self.listener_proto.clone(),
            self.xhr_proto.clone(),
            self.transport.clone(),
            self.location.clone(),
        )
    }

    /// `Function(...args)`
    pub fn call_function(&self, call: FunctionCall) -> ScriptFunction {
        self.window_builtins.function.call(call)
    }

    /// `new Function(...args)`, which never goes through interceptors.
    pub fn construct_function(&self, call: FunctionCall) -> ScriptFunction {
        self.window_builtins
            .function
            .construct(call.clone())
            .unwrap_or_else(|| ScriptFunction::compile(call))
    }

    /// `requestAnimationFrame(callback)`
    pub fn request_animation_frame<F>(&self, callback: F) -> u64
    where
        F: FnOnce(Option<f64>) + Send + 'static,
    {
        self.window_builtins
            .request_animation_frame
            .call(Box::new(callback))
    }

    /// Runs every queued animation frame callback with `timestamp`.
    ///
    /// Returns how many callbacks ran.
    pub fn flush_animation_frames(&self, timestamp: Option<f64>) -> usize {
        let frames = std::mem::take(&mut *self.frames.lock());
        let count = frames.len();
        for (_, callback) in frames {
            callback(timestamp);
        }
        count
    }

    /// `document.hidden`
    pub fn hidden(&self) -> bool {
        self.document_builtins.hidden.call(())
    }

    /// `document.visibilityState`
    pub fn visibility_state(&self) -> String {
        self.document_builtins.visibility_state.call(())
    }

    /// `document.hasFocus()`
    pub fn has_focus(&self) -> bool {
        self.document_builtins.has_focus.call(())
    }

    /// Simulates the tab being hidden or shown, firing `visibilitychange`.
    pub fn set_native_visibility(&self, hidden: bool) {
        self.native_state.hidden.store(hidden, Ordering::SeqCst);
        self.document
            .target()
            .dispatch_event(&Event::new("visibilitychange"));
    }

    /// Simulates the window losing or gaining focus, firing `blur` / `focus`.
    pub fn set_native_focus(&self, focused: bool) {
        self.native_state.focused.store(focused, Ordering::SeqCst);
        let event_type = if focused { "focus" } else { "blur" };
        self.window.dispatch_event(&Event::non_bubbling(event_type));
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("location", &self.location.href())
            .field("history", &self.history)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::network::StaticTransport;
    use crate::hook::point::Next;

    fn page() -> Arc<Page> {
        Page::new("https://lms.example.edu/user/index", Arc::new(StaticTransport::new())).unwrap()
    }

    #[test]
    fn test_vault_captures_every_method() {
        let page = page();
        let vault = page.vault();
        assert!(vault.native_source("window", "fetch").is_some());
        assert!(vault.native_source("EventTarget.prototype", "addEventListener").is_some());
        assert!(vault.native_source("console", "table").is_some());
        assert!(vault.native_source("Document.prototype", "hasFocus").is_some());
    }

    #[test]
    fn test_function_constructor() {
        let page = page();
        let compiled = page.call_function(FunctionCall::new(["a", "b", "return a + b"]));
        assert_eq!(compiled.params, vec!["a", "b"]);
        assert_eq!(compiled.body, "return a + b");
        assert!(page.call_function(FunctionCall::new(["debugger;"])).is_debugger_trap());
        assert!(is_debugger_source(" debugger ; "));
    }

    #[test]
    fn test_construct_function_bypasses_hooks() {
        let page = page();
        let _unhook = page
            .realm()
            .hook(
                "window",
                "Function",
                |_: FunctionCall, next: Next<FunctionCall, ScriptFunction>| {
                    next.call(FunctionCall::default())
                },
            )
            .unwrap();
        assert_eq!(page.call_function(FunctionCall::new(["x"])).body, "");
        assert_eq!(page.construct_function(FunctionCall::new(["x"])).body, "x");
    }

    #[test]
    fn test_animation_frames() {
        let page = page();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        page.request_animation_frame(move |ts| sink.lock().push(ts));
        assert_eq!(page.flush_animation_frames(Some(16.0)), 1);
        assert_eq!(page.flush_animation_frames(Some(32.0)), 0);
        assert_eq!(*seen.lock(), vec![Some(16.0)]);
    }

    #[test]
    fn test_native_visibility() {
        let page = page();
        assert!(!page.hidden());
        page.set_native_visibility(true);
        assert!(page.hidden());
        assert_eq!(page.visibility_state(), "hidden");
        page.set_native_focus(false);
        assert!(!page.has_focus());
    }

    #[test]
    fn test_navigator_language() {
        let page = page();
        assert_eq!(page.navigator_language(), "zh-TW");
        page.set_navigator_language("en-US");
        assert_eq!(page.navigator_language(), "en-US");
    }
}
