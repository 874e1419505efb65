//! Hook layer integration tests
//!
//! Tests for the hook primitive and the event-hook registry driven through a
//! page: idempotent installation, suppression semantics and chain ordering.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tronclass_enhancer::browser::{
    Event, Listener, ListenerOptions, Page, StaticTransport, TargetKind,
};
use tronclass_enhancer::hook::{
    slots, BlockStrategy, EventHookRegistry, HookOptions, HookPoint, Next, NativeVault,
};
use tronclass_enhancer::Services;

fn page() -> Arc<Page> {
    Page::new(
        "https://lms.example.edu/course/12/learning-activity",
        Arc::new(StaticTransport::new()),
    )
    .unwrap()
}

fn counting_listener(counter: &Arc<AtomicUsize>) -> Listener {
    let counter = counter.clone();
    Listener::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

// ============================================================================
// Installation Tests
// ============================================================================

#[test]
fn test_services_install_hooks_twice_wraps_once() {
    let page = page();
    let services = Services::new(page.clone()).unwrap();

    services.install_hooks().unwrap();
    services.install_hooks().unwrap();

    let realm = page.realm();
    assert_eq!(
        realm.interceptor_count(slots::EVENT_TARGET_PROTO, "addEventListener"),
        1
    );
    assert_eq!(
        realm.interceptor_count(slots::EVENT_TARGET_PROTO, "removeEventListener"),
        1
    );
    assert_eq!(realm.interceptor_count(slots::WINDOW, "fetch"), 1);
    assert_eq!(realm.interceptor_count(slots::XHR_PROTO, "open"), 1);
    assert_eq!(realm.interceptor_count(slots::XHR_PROTO, "send"), 1);
}

#[test]
fn test_hooked_functions_still_look_native() {
    let page = page();
    let services = Services::new(page.clone()).unwrap();
    services.install_hooks().unwrap();

    for (target, property) in [
        (slots::EVENT_TARGET_PROTO, "addEventListener"),
        (slots::WINDOW, "fetch"),
        (slots::XHR_PROTO, "send"),
    ] {
        let source = page.realm().source_of(target, property).unwrap();
        assert!(NativeVault::looks_native(&source), "{}.{}: {}", target, property, source);
    }
}

#[test]
fn test_vault_keeps_native_references_after_hooking() {
    let page = page();
    let vault = page.vault();
    let services = Services::new(page.clone()).unwrap();
    services.install_hooks().unwrap();

    assert!(vault
        .native_source(slots::EVENT_TARGET_PROTO, "addEventListener")
        .map(NativeVault::looks_native)
        .unwrap_or(false));
}

// ============================================================================
// Suppression Tests
// ============================================================================

#[test]
fn test_one_enabled_hook_suppresses_despite_disabled_sibling() {
    let page = page();
    let registry = Arc::new(EventHookRegistry::new());
    registry.install(page.realm()).unwrap();

    let a = registry.register_hook("copy", HookOptions::always());
    let _b = registry.register_hook("copy", HookOptions::always().pre_call(|_| true));
    a.disable();

    let fired = Arc::new(AtomicUsize::new(0));
    let document = page.document().target().clone();
    document.add_event_listener("copy", counting_listener(&fired), ListenerOptions::default());
    document.dispatch_event(&Event::new("copy"));

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_all_hooks_disabled_lets_listener_fire() {
    let page = page();
    let registry = Arc::new(EventHookRegistry::new());
    registry.install(page.realm()).unwrap();

    let a = registry.register_hook("copy", HookOptions::always());
    let b = registry.register_hook("copy", HookOptions::always().pre_call(|_| true));
    a.disable();
    b.disable();

    let fired = Arc::new(AtomicUsize::new(0));
    let document = page.document().target().clone();
    document.add_event_listener("copy", counting_listener(&fired), ListenerOptions::default());
    document.dispatch_event(&Event::new("copy"));

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reenabling_hook_applies_to_existing_listener() {
    let page = page();
    let registry = Arc::new(EventHookRegistry::new());
    registry.install(page.realm()).unwrap();

    let hook = registry.register_hook("contextmenu", HookOptions::always());
    let fired = Arc::new(AtomicUsize::new(0));
    let window = page.window().clone();
    window.add_event_listener("contextmenu", counting_listener(&fired), ListenerOptions::default());

    window.dispatch_event(&Event::new("contextmenu"));
    hook.disable();
    window.dispatch_event(&Event::new("contextmenu"));
    hook.enable();
    window.dispatch_event(&Event::new("contextmenu"));

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_pre_hook_limits_wrapping_to_window_targets() {
    let page = page();
    let registry = Arc::new(EventHookRegistry::new());
    registry.install(page.realm()).unwrap();
    registry.register_hook(
        "blur",
        HookOptions::always().pre_hook(|call| call.target.kind() == TargetKind::Window),
    );

    let on_window = Arc::new(AtomicUsize::new(0));
    let on_element = Arc::new(AtomicUsize::new(0));
    page.window()
        .add_event_listener("blur", counting_listener(&on_window), ListenerOptions::default());
    let input = page.document().create_element("input");
    page.document().body().append_child(&input);
    input
        .target()
        .add_event_listener("blur", counting_listener(&on_element), ListenerOptions::default());

    page.window().dispatch_event(&Event::non_bubbling("blur"));
    input.target().dispatch_event(&Event::non_bubbling("blur"));

    assert_eq!(on_window.load(Ordering::SeqCst), 0);
    assert_eq!(on_element.load(Ordering::SeqCst), 1);
}

#[test]
fn test_block_events_stops_inline_handler_and_release_restores() {
    let page = page();
    let registry = Arc::new(EventHookRegistry::new());
    registry.install(page.realm()).unwrap();

    let document = page.document().target().clone();
    let blocked = registry.block_events(&["paste"], &document, BlockStrategy::Propagation);
    let fired = Arc::new(AtomicUsize::new(0));
    document.set_handler("paste", Some(counting_listener(&fired)));
    assert!(document.handler("paste").is_none());

    document.dispatch_event(&Event::new("paste"));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    blocked.release();
    assert!(!document.is_handler_blocked("paste"));
    document.set_handler("paste", Some(counting_listener(&fired)));
    document.dispatch_event(&Event::new("paste"));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_removing_wrapped_listener_detaches_it() {
    let page = page();
    let registry = Arc::new(EventHookRegistry::new());
    registry.install(page.realm()).unwrap();
    let hook = registry.register_hook("keydown", HookOptions::always());
    hook.disable();

    let fired = Arc::new(AtomicUsize::new(0));
    let listener = counting_listener(&fired);
    let window = page.window().clone();
    window.add_event_listener("keydown", listener.clone(), ListenerOptions::default());
    window.remove_event_listener("keydown", &listener, ListenerOptions::default());
    window.dispatch_event(&Event::new("keydown"));

    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(window.listener_count("keydown"), 0);
}

// ============================================================================
// Hook Chain Tests
// ============================================================================

#[test]
fn test_chain_runs_outermost_first_and_unhooks_out_of_order() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let native_trace = trace.clone();
    let point = Arc::new(HookPoint::native("sample", move |x: u32| {
        native_trace.lock().push("native");
        x
    }));

    let first_trace = trace.clone();
    let first = point.install(move |x: u32, next: Next<u32, u32>| {
        first_trace.lock().push("first");
        next.call(x + 1)
    });
    let second_trace = trace.clone();
    let second = point.install(move |x: u32, next: Next<u32, u32>| {
        second_trace.lock().push("second");
        next.call(x * 10)
    });
    let third_trace = trace.clone();
    let third = point.install(move |x: u32, next: Next<u32, u32>| {
        third_trace.lock().push("third");
        next.call(x)
    });

    assert_eq!(point.call(1), 11);
    assert_eq!(*trace.lock(), vec!["third", "second", "first", "native"]);

    trace.lock().clear();
    assert!(second.unhook());
    assert_eq!(point.call(1), 2);
    assert_eq!(*trace.lock(), vec!["third", "first", "native"]);

    assert!(first.unhook());
    assert!(third.unhook());
    assert_eq!(point.interceptor_count(), 0);
    assert_eq!(point.call(7), 7);
}

#[test]
fn test_source_text_survives_interceptors() {
    let point = Arc::new(HookPoint::native("hasFocus", |_: ()| true));
    let unhook = point.install(|_: (), _next: Next<(), bool>| false);

    assert!(!point.call(()));
    assert_eq!(point.to_source(), "function hasFocus() { [native code] }");
    assert!(unhook.unhook());
    assert!(point.call(()));
}
