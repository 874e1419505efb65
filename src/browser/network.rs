//! Network surfaces of the page: the transport, `XMLHttpRequest` and `fetch`.
//!
//! Both request APIs run through hook points (`XMLHttpRequest.prototype.open`,
//! `XMLHttpRequest.prototype.send`, `window.fetch`) so response bodies can be
//! rewritten before page code reads them.

use crate::browser::event::{Event, EventTarget, EventTargetProto, TargetKind};
use crate::browser::location::Location;
use crate::hook::point::HookPoint;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Errors raised by the page's network layer.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    /// The URL could not be parsed or resolved.
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// Method called in the wrong `readyState`.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The transport failed to produce a response.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// An outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method, upper-case.
    pub method: String,
    /// Absolute URL.
    pub url: url::Url,
    /// Request body.
    pub body: Option<String>,
}

/// A received HTTP response with a fully buffered body.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Final URL.
    pub url: String,
    /// Status code.
    pub status: u16,
    /// Status text.
    pub status_text: String,
    /// Response headers, names lower-cased.
    pub headers: Vec<(String, String)>,
    /// Body text.
    pub body: String,
}

impl HttpResponse {
    /// A `200 OK` response.
    pub fn ok(url: impl Into<String>, content_type: &str, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![("content-type".to_string(), content_type.to_string())],
            body: body.into(),
        }
    }

    /// A `404 Not Found` response.
    pub fn not_found(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: 404,
            status_text: "Not Found".to_string(),
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: String::new(),
        }
    }

    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// `content-type` header, empty when absent.
    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }

    /// Same status and headers with a replaced body.
    pub fn with_body(&self, body: String) -> Self {
        Self {
            body,
            ..self.clone()
        }
    }
}

/// Produces responses for the page's requests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one request.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, NetworkError>;
}

/// Transport serving canned responses keyed by URL path (plus query).
///
/// Unknown paths get a `404`.
#[derive(Debug, Default)]
pub struct StaticTransport {
    routes: RwLock<HashMap<String, HttpResponse>>,
}

impl StaticTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `body` as `application/json` at `path`.
    pub fn with_json(self, path: &str, body: impl Into<String>) -> Self {
        self.insert(path, "application/json; charset=utf-8", body);
        self
    }

    /// Serves a response with an explicit content type at `path`.
    pub fn with_response(self, path: &str, content_type: &str, body: impl Into<String>) -> Self {
        self.insert(path, content_type, body);
        self
    }

    /// Adds or replaces a route.
    pub fn insert(&self, path: &str, content_type: &str, body: impl Into<String>) {
        self.routes
            .write()
            .insert(path.to_string(), HttpResponse::ok(path, content_type, body));
    }

    fn key(url: &url::Url) -> String {
        match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        }
    }
}

#[async_trait]
impl Transport for StaticTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, NetworkError> {
        let routes = self.routes.read();
        let response = routes
            .get(&Self::key(&request.url))
            .or_else(|| routes.get(request.url.path()))
            .map(|canned| HttpResponse {
                url: request.url.to_string(),
                ..canned.clone()
            })
            .unwrap_or_else(|| HttpResponse::not_found(request.url.to_string()));
        trace!("{} {} -> {}", request.method, request.url, response.status);
        Ok(response)
    }
}

/// Arguments of a `fetch` call.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Request URL as written by the caller, possibly relative.
    pub url: String,
    /// Method, `GET` by default.
    pub method: String,
    /// Optional body.
    pub body: Option<String>,
}

impl FetchRequest {
    /// A `GET` request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            body: None,
        }
    }
}

/// Result type of `window.fetch`.
pub type FetchFuture = BoxFuture<'static, Result<HttpResponse, NetworkError>>;

/// Builds the native `window.fetch` hook point.
pub(crate) fn native_fetch(
    location: Location,
    transport: Arc<dyn Transport>,
) -> HookPoint<FetchRequest, FetchFuture> {
    HookPoint::native("fetch", move |request: FetchRequest| {
        let location = location.clone();
        let transport = transport.clone();
        async move {
            let url = location.resolve(&request.url)?;
            transport
                .send(HttpRequest {
                    method: request.method.to_uppercase(),
                    url,
                    body: request.body,
                })
                .await
        }
        .boxed()
    })
}

/// Arguments of `XMLHttpRequest.prototype.open`.
#[derive(Clone)]
pub struct XhrOpen {
    /// Receiver.
    pub xhr: Arc<XmlHttpRequest>,
    /// Method.
    pub method: String,
    /// URL as written by the caller.
    pub url: String,
}

/// Arguments of `XMLHttpRequest.prototype.send`.
#[derive(Clone)]
pub struct XhrSend {
    /// Receiver.
    pub xhr: Arc<XmlHttpRequest>,
    /// Request body.
    pub body: Option<String>,
}

/// Result type of `XMLHttpRequest.prototype.send`.
pub type XhrSendFuture = BoxFuture<'static, Result<(), NetworkError>>;

/// Shared `XMLHttpRequest.prototype` methods.
pub struct XhrProto {
    /// `open`
    pub open: Arc<HookPoint<XhrOpen, Result<(), NetworkError>>>,
    /// `send`
    pub send: Arc<HookPoint<XhrSend, XhrSendFuture>>,
}

impl XhrProto {
    /// Creates the prototype with native semantics.
    pub fn new() -> Self {
        Self {
            open: Arc::new(HookPoint::native("open", |args: XhrOpen| {
                let url = args.xhr.location.resolve(&args.url)?;
                *args.xhr.request.write() = Some((args.method.to_uppercase(), url));
                args.xhr.set_ready_state(XmlHttpRequest::OPENED);
                Ok(())
            })),
            send: Arc::new(HookPoint::native("send", |args: XhrSend| {
                native_send(args.xhr, args.body).boxed()
            })),
        }
    }
}

impl Default for XhrProto {
    fn default() -> Self {
        Self::new()
    }
}

async fn native_send(xhr: Arc<XmlHttpRequest>, body: Option<String>) -> Result<(), NetworkError> {
    let (method, url) = xhr
        .request
        .read()
        .clone()
        .ok_or_else(|| NetworkError::InvalidState("send() called before open()".to_string()))?;

    let response = xhr
        .transport
        .send(HttpRequest { method, url, body })
        .await?;

    xhr.status.store(response.status, Ordering::SeqCst);
    *xhr.response_headers.write() = response.headers.clone();
    xhr.set_ready_state(XmlHttpRequest::HEADERS_RECEIVED);

    *xhr.raw_text.write() = response.body;
    xhr.set_ready_state(XmlHttpRequest::LOADING);
    xhr.set_ready_state(XmlHttpRequest::DONE);

    xhr.target.dispatch_event(&Event::non_bubbling("load"));
    xhr.target.dispatch_event(&Event::non_bubbling("loadend"));
    Ok(())
}

/// How `response` is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// `""` / `"text"`
    #[default]
    Text,
    /// `"json"`
    Json,
}

/// Value of `xhr.response`.
#[derive(Debug, Clone, PartialEq)]
pub enum XhrResponse {
    /// Plain text body.
    Text(String),
    /// Parsed JSON body.
    Json(Value),
}

struct ResponseOverride {
    text: String,
    parsed: OnceCell<XhrResponse>,
}

/// An `XMLHttpRequest` instance.
pub struct XmlHttpRequest {
    target: EventTarget,
    proto: Arc<XhrProto>,
    transport: Arc<dyn Transport>,
    location: Location,
    request: RwLock<Option<(String, url::Url)>>,
    ready_state: AtomicU8,
    status: AtomicU16,
    response_type: RwLock<ResponseType>,
    response_headers: RwLock<Vec<(String, String)>>,
    raw_text: RwLock<String>,
    response_override: RwLock<Option<ResponseOverride>>,
    extensions: RwLock<HashMap<String, String>>,
}

impl XmlHttpRequest {
    /// `UNSENT`
    pub const UNSENT: u8 = 0;
    /// `OPENED`
    pub const OPENED: u8 = 1;
    /// `HEADERS_RECEIVED`
    pub const HEADERS_RECEIVED: u8 = 2;
    /// `LOADING`
    pub const LOADING: u8 = 3;
    /// `DONE`
    pub const DONE: u8 = 4;

    pub(crate) fn new(
        listener_proto: Arc<EventTargetProto>,
        proto: Arc<XhrProto>,
        transport: Arc<dyn Transport>,
        location: Location,
    ) -> Arc<Self> {
        Arc::new(Self {
            target: EventTarget::new(TargetKind::XmlHttpRequest, "XMLHttpRequest", listener_proto),
            proto,
            transport,
            location,
            request: RwLock::new(None),
            ready_state: AtomicU8::new(Self::UNSENT),
            status: AtomicU16::new(0),
            response_type: RwLock::new(ResponseType::Text),
            response_headers: RwLock::new(Vec::new()),
            raw_text: RwLock::new(String::new()),
            response_override: RwLock::new(None),
            extensions: RwLock::new(HashMap::new()),
        })
    }

    /// The instance as an event target.
    pub fn target(&self) -> &EventTarget {
        &self.target
    }

    /// `xhr.open(method, url)` through the prototype hook point.
    pub fn open(self: &Arc<Self>, method: &str, url: &str) -> Result<(), NetworkError> {
        self.proto.open.call(XhrOpen {
            xhr: self.clone(),
            method: method.to_string(),
            url: url.to_string(),
        })
    }

    /// `xhr.send(body)` through the prototype hook point.
    ///
    /// Resolves once the request has completed and `load` has fired.
    pub async fn send(self: &Arc<Self>, body: Option<String>) -> Result<(), NetworkError> {
        self.proto
            .send
            .call(XhrSend {
                xhr: self.clone(),
                body,
            })
            .await
    }

    /// `xhr.responseType = ...`
    pub fn set_response_type(&self, response_type: ResponseType) {
        *self.response_type.write() = response_type;
    }

    /// `xhr.readyState`
    pub fn ready_state(&self) -> u8 {
        self.ready_state.load(Ordering::SeqCst)
    }

    /// `xhr.status`
    pub fn status(&self) -> u16 {
        self.status.load(Ordering::SeqCst)
    }

    /// `xhr.getResponseHeader(name)`
    pub fn response_header(&self, name: &str) -> Option<String> {
        self.response_headers
            .read()
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    /// `xhr.responseText`, honouring a redefined property.
    pub fn response_text(&self) -> String {
        if let Some(redefined) = self.response_override.read().as_ref() {
            return redefined.text.clone();
        }
        self.raw_text.read().clone()
    }

    /// `xhr.response`, honouring a redefined property.
    ///
    /// A redefined response parses its text as JSON once, falling back to the text.
    pub fn response(&self) -> XhrResponse {
        if let Some(redefined) = self.response_override.read().as_ref() {
            return redefined
                .parsed
                .get_or_init(|| match serde_json::from_str(&redefined.text) {
                    Ok(value) => XhrResponse::Json(value),
                    Err(_) => XhrResponse::Text(redefined.text.clone()),
                })
                .clone();
        }

        let raw = self.raw_text.read();
        match *self.response_type.read() {
            ResponseType::Text => XhrResponse::Text(raw.clone()),
            ResponseType::Json => serde_json::from_str(&raw)
                .map(XhrResponse::Json)
                .unwrap_or(XhrResponse::Json(Value::Null)),
        }
    }

    /// Text as delivered by the network, ignoring redefinitions.
    pub fn native_response_text(&self) -> String {
        self.raw_text.read().clone()
    }

    /// Redefines `responseText` and `response` on this instance.
    pub fn define_response_override(&self, text: String) {
        *self.response_override.write() = Some(ResponseOverride {
            text,
            parsed: OnceCell::new(),
        });
    }

    /// Whether the response properties have been redefined.
    pub fn has_response_override(&self) -> bool {
        self.response_override.read().is_some()
    }

    /// Reads an expando property.
    pub fn extension(&self, key: &str) -> Option<String> {
        self.extensions.read().get(key).cloned()
    }

    /// Sets an expando property.
    pub fn set_extension(&self, key: &str, value: impl Into<String>) {
        self.extensions.write().insert(key.to_string(), value.into());
    }

    fn set_ready_state(&self, state: u8) {
        self.ready_state.store(state, Ordering::SeqCst);
        self.target.dispatch_event(&Event::non_bubbling("readystatechange"));
    }
}

impl fmt::Debug for XmlHttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XmlHttpRequest")
            .field("request", &*self.request.read())
            .field("ready_state", &self.ready_state())
            .field("status", &self.status())
            .field("overridden", &self.has_response_override())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::event::{Listener, ListenerOptions};
    use parking_lot::Mutex;

    fn xhr(transport: StaticTransport) -> Arc<XmlHttpRequest> {
        XmlHttpRequest::new(
            Arc::new(EventTargetProto::new()),
            Arc::new(XhrProto::new()),
            Arc::new(transport),
            Location::new("https://lms.example.edu/course/1").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_xhr_ready_state_sequence() {
        let xhr = xhr(StaticTransport::new().with_json("/api/user", r#"{"id":1}"#));
        let states = Arc::new(Mutex::new(Vec::new()));
        let observed = states.clone();
        let handle = xhr.clone();
        xhr.target().add_event_listener(
            "readystatechange",
            Listener::new(move |_| observed.lock().push(handle.ready_state())),
            ListenerOptions::default(),
        );

        xhr.open("get", "/api/user").unwrap();
        xhr.send(None).await.unwrap();

        assert_eq!(*states.lock(), vec![1, 2, 3, 4]);
        assert_eq!(xhr.status(), 200);
        assert_eq!(xhr.response_text(), r#"{"id":1}"#);
        assert!(xhr.response_header("Content-Type").unwrap().contains("json"));
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let xhr = xhr(StaticTransport::new());
        let result = xhr.send(None).await;
        assert!(matches!(result, Err(NetworkError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_response_override_parses_once() {
        let xhr = xhr(StaticTransport::new().with_json("/a", "{}"));
        xhr.open("GET", "/a").unwrap();
        xhr.send(None).await.unwrap();

        xhr.define_response_override(r#"{"ok":true}"#.to_string());
        assert_eq!(xhr.response_text(), r#"{"ok":true}"#);
        assert_eq!(xhr.response(), XhrResponse::Json(serde_json::json!({"ok": true})));
        assert_eq!(xhr.native_response_text(), "{}");
    }

    #[tokio::test]
    async fn test_static_transport_not_found() {
        let transport = StaticTransport::new();
        let response = transport
            .send(HttpRequest {
                method: "GET".into(),
                url: url::Url::parse("https://lms.example.edu/missing").unwrap(),
                body: None,
            })
            .await
            .unwrap();
        assert_eq!(response.status, 404);
    }
}
