//! Browser module modelling the page the enhancer is injected into.
//!
//! This module contains the platform surfaces the interception layer patches:
//! event targets, the DOM, location and history, the network APIs, the console
//! and the page runtime that ties them together.
//!
//! # Submodules
//!
//! - [`event`] - Events, listeners and event-target dispatch
//! - [`dom`] - Element tree, selectors and view-layer helpers
//! - [`location`] - `location` and session history
//! - [`network`] - Transport, `XMLHttpRequest` and `fetch`
//! - [`console`] - Buffered `console`
//! - [`page`] - The page runtime and its realm

pub mod console;
pub mod dom;
pub mod event;
pub mod location;
pub mod network;
pub mod page;

// Re-export commonly used types for convenience
pub use console::{Console, ConsoleArg, ConsoleCall, ConsoleLine, BuiltinKind};
pub use dom::{Document, DomAccessor, DomError, Element, PageDom, StyleHandle};
pub use event::{
    Event, EventPhase, EventTarget, EventTargetProto, KeyModifiers, Listener, ListenerCall, ListenerOptions,
    TargetKind, WeakListener,
};
pub use location::{History, Location, RouteInfo};
pub use network::{
    FetchFuture, FetchRequest, HttpRequest, HttpResponse, NetworkError, ResponseType,
    StaticTransport, Transport, XhrOpen, XhrProto, XhrResponse, XhrSend, XhrSendFuture,
    XmlHttpRequest,
};
pub use page::{is_debugger_source, FrameCallback, FunctionCall, Page, ScriptFunction};
