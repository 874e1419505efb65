//! Request hook integration tests
//!
//! Tests for response-body rewriting through `fetch` and `XMLHttpRequest`,
//! including chain composition and the built-in course unlocks.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tronclass_enhancer::browser::{
    FetchRequest, Listener, ListenerOptions, Page, StaticTransport, XmlHttpRequest,
};
use tronclass_enhancer::hook::{json_transform, UrlMatcher};
use tronclass_enhancer::modules::course::{unlock_flag, ACTIVITY_API_PATTERN};
use tronclass_enhancer::Services;

fn services_with(transport: StaticTransport, url: &str) -> Arc<Services> {
    let page = Page::new(url, Arc::new(transport)).unwrap();
    let services = Services::new(page).unwrap();
    services.install_hooks().unwrap();
    Arc::new(services)
}

fn flip(key: &'static str) -> tronclass_enhancer::hook::TransformFn {
    json_transform(move |document: &mut Value| {
        let Some(flag) = document.get_mut(key) else {
            return Ok(false);
        };
        if *flag == Value::Bool(false) {
            *flag = Value::Bool(true);
            return Ok(true);
        }
        Ok(false)
    })
}

// ============================================================================
// Chain Composition Tests
// ============================================================================

#[test]
fn test_independent_hooks_compose_in_either_order() {
    let services = services_with(StaticTransport::new(), "https://lms.example.edu/");
    let expected = r#"{"a":true,"b":true}"#;

    let requests = services.requests();
    let a = requests.register_request_hook(UrlMatcher::path("^/flags$").unwrap(), flip("a"));
    let b = requests.register_request_hook(UrlMatcher::path("^/flags$").unwrap(), flip("b"));
    assert_eq!(
        requests.run_request_hooks("/flags", r#"{"a":false,"b":false}"#),
        expected
    );
    a.unregister();
    b.unregister();

    requests.register_request_hook(UrlMatcher::path("^/flags$").unwrap(), flip("b"));
    requests.register_request_hook(UrlMatcher::path("^/flags$").unwrap(), flip("a"));
    assert_eq!(
        requests.run_request_hooks("/flags", r#"{"a":false,"b":false}"#),
        expected
    );
}

#[test]
fn test_failing_hook_is_skipped() {
    let services = services_with(StaticTransport::new(), "https://lms.example.edu/");
    let requests = services.requests();
    requests.register_request_hook(
        UrlMatcher::path("^/flags$").unwrap(),
        json_transform(|_| anyhow::bail!("broken transform")),
    );
    requests.register_request_hook(UrlMatcher::path("^/flags$").unwrap(), flip("a"));

    assert_eq!(
        requests.run_request_hooks("/flags", r#"{"a":false}"#),
        r#"{"a":true}"#
    );
}

#[test]
fn test_non_json_body_passes_through() {
    let services = services_with(StaticTransport::new(), "https://lms.example.edu/");
    let requests = services.requests();
    requests.register_request_hook(UrlMatcher::path("^/flags$").unwrap(), flip("a"));

    assert_eq!(requests.run_request_hooks("/flags", "<html></html>"), "<html></html>");
}

#[test]
fn test_disabled_hook_does_not_run() {
    let services = services_with(StaticTransport::new(), "https://lms.example.edu/");
    let requests = services.requests();
    let hook = requests.register_request_hook(UrlMatcher::path("^/flags$").unwrap(), flip("a"));
    hook.disable();

    assert_eq!(
        requests.run_request_hooks("/flags", r#"{"a":false}"#),
        r#"{"a":false}"#
    );
    hook.enable();
    assert_eq!(
        requests.run_request_hooks("/flags", r#"{"a":false}"#),
        r#"{"a":true}"#
    );
}

// ============================================================================
// XMLHttpRequest Tests
// ============================================================================

#[tokio::test]
async fn test_xhr_response_text_rewritten_with_key_order() {
    let transport = StaticTransport::new()
        .with_json("/api/activities/42", r#"{"data":{"allow_download":false}}"#);
    let services = services_with(transport, "https://lms.example.edu/course/12/learning-activity");
    services.requests().register_request_hook(
        UrlMatcher::path(ACTIVITY_API_PATTERN).unwrap(),
        json_transform(|document| Ok(unlock_flag(document, "allow_download"))),
    );

    let xhr = services.page().xhr();
    let seen = Arc::new(Mutex::new(None));
    let handle = Arc::downgrade(&xhr);
    let observed = seen.clone();
    xhr.target().add_event_listener(
        "readystatechange",
        Listener::new(move |_| {
            if let Some(xhr) = handle.upgrade() {
                if xhr.ready_state() == XmlHttpRequest::DONE {
                    *observed.lock() = Some(xhr.response_text());
                }
            }
        }),
        ListenerOptions::default(),
    );

    xhr.open("GET", "/api/activities/42").unwrap();
    xhr.send(None).await.unwrap();

    assert_eq!(
        seen.lock().as_deref(),
        Some(r#"{"data":{"allow_download":true}}"#)
    );
    assert_eq!(xhr.response_text(), r#"{"data":{"allow_download":true}}"#);
    assert_eq!(
        xhr.native_response_text(),
        r#"{"data":{"allow_download":false}}"#
    );
}

#[tokio::test]
async fn test_xhr_unmatched_url_untouched() {
    let transport = StaticTransport::new().with_json("/api/users/42", r#"{"allow_download":false}"#);
    let services = services_with(transport, "https://lms.example.edu/");
    services.requests().register_request_hook(
        UrlMatcher::path(ACTIVITY_API_PATTERN).unwrap(),
        json_transform(|document| Ok(unlock_flag(document, "allow_download"))),
    );

    let xhr = services.page().xhr();
    xhr.open("GET", "/api/users/42").unwrap();
    xhr.send(None).await.unwrap();

    assert!(!xhr.has_response_override());
    assert_eq!(xhr.response_text(), r#"{"allow_download":false}"#);
}

// ============================================================================
// Fetch Tests
// ============================================================================

#[tokio::test]
async fn test_fetch_body_rewritten() {
    let transport = StaticTransport::new().with_json(
        "/api/activities/7",
        r#"{"type":"video","allow_forward_seeking":false,"nested":{"allow_forward_seeking":false}}"#,
    );
    let services = services_with(transport, "https://lms.example.edu/course/3/learning-activity");
    services.requests().register_request_hook(
        UrlMatcher::path(ACTIVITY_API_PATTERN).unwrap(),
        json_transform(|document| Ok(unlock_flag(document, "allow_forward_seeking"))),
    );

    let response = services
        .page()
        .fetch(FetchRequest::get("/api/activities/7"))
        .await
        .unwrap();
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(
        body,
        json!({"type": "video", "allow_forward_seeking": true, "nested": {"allow_forward_seeking": true}})
    );
}

#[tokio::test]
async fn test_fetch_skips_binary_content() {
    let transport =
        StaticTransport::new().with_response("/api/activities/8", "application/octet-stream", "{\"a\":false}");
    let services = services_with(transport, "https://lms.example.edu/");
    services
        .requests()
        .register_request_hook(UrlMatcher::path(ACTIVITY_API_PATTERN).unwrap(), flip("a"));

    let response = services
        .page()
        .fetch(FetchRequest::get("/api/activities/8"))
        .await
        .unwrap();
    assert_eq!(response.body, "{\"a\":false}");
}
