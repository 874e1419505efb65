//! Devtools-detection countermeasures.
//!
//! Detection scripts typically log an element with an `id` getter, or a
//! `RegExp`/`Date`/function whose `toString` was replaced, and watch whether
//! the console evaluates it. Others compile `Function("debugger")` in a loop,
//! flood the console with huge objects, or time `requestAnimationFrame`
//! timestamps. Each of these is neutralised by an interceptor on the matching
//! slot of the realm.

use crate::browser::console::{ConsoleArg, ConsoleCall};
use crate::browser::event::Event;
use crate::browser::page::{is_debugger_source, FrameCallback, FunctionCall, ScriptFunction};
use crate::hook::events::{EventHookController, EventHookRegistry, HookOptions};
use crate::hook::point::{Next, Unhook};
use crate::hook::realm::Realm;
use crate::hook::vault::NativeVault;
use crate::hook::{slots, HookInstallError};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Arguments beyond this many entries are truncated before logging.
const MAX_ENTRIES: usize = 5;

/// Logging the same object again within this window is suppressed.
const REPEAT_INTERVAL_MS: f64 = 300.0;

/// Options of [`disable_devtool_detector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevtoolOptions {
    /// Let `console.clear()` through.
    pub allow_console_clear: bool,
}

impl Default for DevtoolOptions {
    fn default() -> Self {
        Self {
            allow_console_clear: true,
        }
    }
}

/// Remembers when each object was last logged.
#[derive(Default)]
struct RepeatTracker {
    last_logged: Mutex<HashMap<u64, f64>>,
}

impl RepeatTracker {
    /// Records `identity` at `now`; true if it was seen within the interval.
    fn is_repeat(&self, identity: u64, now: f64) -> bool {
        let mut last_logged = self.last_logged.lock();
        let repeat = last_logged
            .get(&identity)
            .map(|last| now - last < REPEAT_INTERVAL_MS)
            .unwrap_or(false);
        if !repeat {
            last_logged.retain(|_, last| now - *last < REPEAT_INTERVAL_MS);
            last_logged.insert(identity, now);
        }
        repeat
    }
}

fn limit_value(value: Value) -> Value {
    match value {
        Value::Array(items) if items.len() > MAX_ENTRIES => {
            Value::Array(items.into_iter().take(MAX_ENTRIES).collect())
        }
        Value::Object(map) if map.len() > MAX_ENTRIES => {
            Value::Object(map.into_iter().take(MAX_ENTRIES).collect::<Map<String, Value>>())
        }
        other => other,
    }
}

fn limit_arg(arg: ConsoleArg) -> ConsoleArg {
    match arg {
        ConsoleArg::Value(value) => ConsoleArg::Value(limit_value(value)),
        ConsoleArg::Object { identity, value } => ConsoleArg::Object {
            identity,
            value: limit_value(value),
        },
        other => other,
    }
}

fn is_detector_bait(arg: &ConsoleArg) -> bool {
    match arg {
        ConsoleArg::Element { has_own_id, .. } => *has_own_id,
        ConsoleArg::Builtin {
            to_string_source, ..
        } => !NativeVault::looks_native(to_string_source),
        _ => false,
    }
}

/// Installs the console, `Function` and `console.clear` countermeasures.
///
/// Returns the handles of every installed interceptor; on error, the ones
/// already installed are removed again.
pub fn disable_devtool_detector(
    realm: &Realm,
    vault: Arc<NativeVault>,
    options: DevtoolOptions,
) -> Result<Vec<Unhook>, HookInstallError> {
    let mut unhooks = Vec::new();
    let result = install_all(realm, vault, options, &mut unhooks);
    if let Err(e) = result {
        for unhook in unhooks {
            let _ = unhook.unhook();
        }
        return Err(e);
    }
    debug!("Devtools detector countermeasures installed ({} hooks)", unhooks.len());
    Ok(unhooks)
}

fn install_all(
    realm: &Realm,
    vault: Arc<NativeVault>,
    options: DevtoolOptions,
    unhooks: &mut Vec<Unhook>,
) -> Result<(), HookInstallError> {
    let tracker = Arc::new(RepeatTracker::default());

    let log_tracker = tracker.clone();
    let log_clock = vault.clone();
    unhooks.push(realm.hook(
        slots::CONSOLE,
        "log",
        move |call: ConsoleCall, next: Next<ConsoleCall, ()>| {
            if call.args.is_empty() {
                return next.call(call);
            }
            let first = &call.args[0];
            if is_detector_bait(first) {
                return next.call(ConsoleCall::default());
            }
            if let ConsoleArg::Object { identity, .. } = first {
                if log_tracker.is_repeat(*identity, log_clock.now()) {
                    return next.call(ConsoleCall::new(vec![ConsoleArg::text(
                        "[Repeated log suppressed]",
                    )]));
                }
            }
            next.call(ConsoleCall::new(call.args.into_iter().map(limit_arg).collect()))
        },
    )?);

    let table_tracker = tracker;
    let table_clock = vault;
    unhooks.push(realm.hook(
        slots::CONSOLE,
        "table",
        move |call: ConsoleCall, next: Next<ConsoleCall, ()>| {
            let mut args = call.args.into_iter();
            let Some(first) = args.next() else {
                return next.call(ConsoleCall::default());
            };
            let rest: Vec<ConsoleArg> = args.collect();

            if is_detector_bait(&first) {
                return next.call(ConsoleCall::default());
            }
            if let ConsoleArg::Object { identity, .. } = &first {
                if table_tracker.is_repeat(*identity, table_clock.now()) {
                    let mut suppressed = vec![ConsoleArg::text("[Repeated table suppressed]")];
                    suppressed.extend(rest);
                    return next.call(ConsoleCall::new(suppressed));
                }
            }

            let mut limited = vec![limit_arg(first)];
            limited.extend(rest);
            next.call(ConsoleCall::new(limited))
        },
    )?);

    unhooks.push(realm.hook(slots::CONSOLE, "clear", move |_: (), next: Next<(), ()>| {
        if options.allow_console_clear {
            next.call(())
        }
    })?);

    unhooks.push(realm.hook(
        slots::WINDOW,
        "Function",
        |call: FunctionCall, next: Next<FunctionCall, ScriptFunction>| {
            let trap = call
                .args
                .last()
                .map(|body| is_debugger_source(body))
                .unwrap_or(false);
            if trap {
                next.call(FunctionCall::default())
            } else {
                next.call(call)
            }
        },
    )?);

    Ok(())
}

/// Fills in a missing `requestAnimationFrame` timestamp from the native clock.
pub fn spoof_animation_frames(realm: &Realm, vault: Arc<NativeVault>) -> Result<Unhook, HookInstallError> {
    realm.hook(
        slots::WINDOW,
        "requestAnimationFrame",
        move |callback: FrameCallback, next: Next<FrameCallback, u64>| {
            let clock = vault.clone();
            next.call(Box::new(move |timestamp: Option<f64>| {
                callback(Some(timestamp.unwrap_or_else(|| clock.now())))
            }))
        },
    )
}

/// Whether a keyboard event is a devtools shortcut (F12, view-source, save,
/// inspector and console chords).
pub fn is_devtool_shortcut(event: &Event, mac: bool) -> bool {
    let Some(key) = event.key() else {
        return false;
    };
    let key = key.to_lowercase();
    let m = event.modifiers();

    if key == "f12" {
        return true;
    }
    if mac {
        (m.meta && key == "s")
            || (m.meta && m.alt && key == "u")
            || (m.meta && m.alt && (key == "i" || key == "j"))
    } else {
        (m.ctrl && (key == "u" || key == "s")) || (m.ctrl && m.shift && (key == "i" || key == "j"))
    }
}

/// Suppresses devtools shortcuts for every hooked key listener.
pub fn block_devtool_shortcuts(registry: &EventHookRegistry, mac: bool) -> Vec<EventHookController> {
    ["keyup", "keydown", "keypress"]
        .into_iter()
        .map(|event_type| {
            registry.register_hook(
                event_type,
                HookOptions::always().pre_call(move |event| is_devtool_shortcut(event, mac)),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::console::BuiltinKind;
    use crate::browser::event::KeyModifiers;
    use crate::browser::network::StaticTransport;
    use crate::browser::page::Page;
    use serde_json::json;

    fn page() -> Arc<Page> {
        Page::new("https://lms.example.edu/", Arc::new(StaticTransport::new())).unwrap()
    }

    fn log(page: &Page, args: Vec<ConsoleArg>) {
        page.console().log.call(ConsoleCall::new(args));
    }

    #[test]
    fn test_element_bait_is_not_evaluated() {
        let page = page();
        let _hooks = disable_devtool_detector(page.realm(), page.vault(), DevtoolOptions::default()).unwrap();

        log(
            &page,
            vec![ConsoleArg::Element {
                tag: "div".into(),
                has_own_id: true,
            }],
        );
        log(
            &page,
            vec![ConsoleArg::Builtin {
                kind: BuiltinKind::RegExp,
                to_string_source: "() => { detected = true }".into(),
            }],
        );
        log(&page, vec![ConsoleArg::native_builtin(BuiltinKind::Date)]);

        let lines = page.console().lines();
        assert!(lines[0].args.is_empty());
        assert!(lines[1].args.is_empty());
        assert_eq!(lines[2].args.len(), 1);
    }

    #[test]
    fn test_repeated_object_is_suppressed_and_truncated() {
        let page = page();
        let _hooks = disable_devtool_detector(page.realm(), page.vault(), DevtoolOptions::default()).unwrap();
        let big = ConsoleArg::Object {
            identity: 7,
            value: json!([1, 2, 3, 4, 5, 6, 7]),
        };

        log(&page, vec![big.clone()]);
        log(&page, vec![big]);

        let lines = page.console().lines();
        assert_eq!(
            lines[0].args,
            vec![ConsoleArg::Object {
                identity: 7,
                value: json!([1, 2, 3, 4, 5])
            }]
        );
        assert_eq!(lines[1].args, vec![ConsoleArg::text("[Repeated log suppressed]")]);
    }

    #[test]
    fn test_table_keeps_first_five_keys() {
        let page = page();
        let _hooks = disable_devtool_detector(page.realm(), page.vault(), DevtoolOptions::default()).unwrap();
        page.console().table.call(ConsoleCall::new(vec![ConsoleArg::Value(
            json!({"a": 1, "b": 2, "c": 3, "d": 4, "e": 5, "f": 6}),
        )]));
        let lines = page.console().lines();
        assert_eq!(
            lines[0].args,
            vec![ConsoleArg::Value(json!({"a": 1, "b": 2, "c": 3, "d": 4, "e": 5}))]
        );
    }

    #[test]
    fn test_debugger_function_is_defused() {
        let page = page();
        let _hooks = disable_devtool_detector(page.realm(), page.vault(), DevtoolOptions::default()).unwrap();
        let compiled = page.call_function(FunctionCall::new(["debugger;"]));
        assert!(!compiled.is_debugger_trap());
        let normal = page.call_function(FunctionCall::new(["a", "return a"]));
        assert_eq!(normal.params, vec!["a"]);
        assert_eq!(
            page.realm().source_of("window", "Function").unwrap(),
            "function Function() { [native code] }"
        );
    }

    #[test]
    fn test_console_clear_can_be_swallowed() {
        let page = page();
        let _hooks = disable_devtool_detector(
            page.realm(),
            page.vault(),
            DevtoolOptions {
                allow_console_clear: false,
            },
        )
        .unwrap();
        log(&page, vec![ConsoleArg::text("kept")]);
        page.console().clear.call(());
        assert_eq!(page.console().lines().len(), 1);
    }

    #[test]
    fn test_spoofed_animation_frame_timestamp() {
        let page = page();
        let _unhook = spoof_animation_frames(page.realm(), page.vault()).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        page.request_animation_frame(move |ts| *sink.lock() = ts);
        page.flush_animation_frames(None);
        assert!(seen.lock().is_some());
    }

    #[test]
    fn test_devtool_shortcuts() {
        let f12 = Event::keyboard("keydown", "F12", KeyModifiers::default());
        let inspect = Event::keyboard(
            "keydown",
            "I",
            KeyModifiers {
                ctrl: true,
                shift: true,
                ..Default::default()
            },
        );
        let typing = Event::keyboard("keydown", "i", KeyModifiers::default());
        assert!(is_devtool_shortcut(&f12, false));
        assert!(is_devtool_shortcut(&inspect, false));
        assert!(!is_devtool_shortcut(&inspect, true));
        assert!(!is_devtool_shortcut(&typing, false));
    }
}
