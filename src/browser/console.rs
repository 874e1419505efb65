//! `console` of the page.
//!
//! Output is kept in an inspectable buffer instead of a devtools panel.

use crate::hook::point::HookPoint;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Kind of a built-in object whose `toString` detectors like to override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    /// `Date`
    Date,
    /// `RegExp`
    RegExp,
    /// `Function`
    Function,
}

/// One argument passed to a console method.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleArg {
    /// A string.
    Text(String),
    /// A primitive or structured value without identity.
    Value(Value),
    /// A DOM element. `has_own_id` is true when `id` was redefined on the
    /// instance itself (the getter trick detectors use).
    Element {
        /// Tag name.
        tag: String,
        /// Whether `id` is an own property.
        has_own_id: bool,
    },
    /// A `Date`, `RegExp` or function, with the source of its `toString`.
    Builtin {
        /// Object kind.
        kind: BuiltinKind,
        /// `Function.prototype.toString` applied to the object's `toString`.
        to_string_source: String,
    },
    /// An object with reference identity.
    Object {
        /// Identity of the object.
        identity: u64,
        /// Its enumerable own properties.
        value: Value,
    },
}

impl ConsoleArg {
    /// Shorthand for [`ConsoleArg::Text`].
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// A built-in whose `toString` is untouched.
    pub fn native_builtin(kind: BuiltinKind) -> Self {
        Self::Builtin {
            kind,
            to_string_source: "function toString() { [native code] }".to_string(),
        }
    }
}

/// Arguments of a console call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsoleCall {
    /// Positional arguments.
    pub args: Vec<ConsoleArg>,
}

impl ConsoleCall {
    /// Creates a call from its arguments.
    pub fn new(args: Vec<ConsoleArg>) -> Self {
        Self { args }
    }
}

/// A line written to the console buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleLine {
    /// Console method (`log`, `table`).
    pub method: &'static str,
    /// Arguments as they reached the native implementation.
    pub args: Vec<ConsoleArg>,
}

/// The page console.
pub struct Console {
    /// `console.log`
    pub log: Arc<HookPoint<ConsoleCall, ()>>,
    /// `console.table`
    pub table: Arc<HookPoint<ConsoleCall, ()>>,
    /// `console.clear`
    pub clear: Arc<HookPoint<(), ()>>,
    buffer: Arc<Mutex<Vec<ConsoleLine>>>,
}

impl Console {
    /// Creates a console with an empty buffer.
    pub fn new() -> Self {
        let buffer: Arc<Mutex<Vec<ConsoleLine>>> = Arc::new(Mutex::new(Vec::new()));
        let log_buffer = buffer.clone();
        let table_buffer = buffer.clone();
        let clear_buffer = buffer.clone();

        Self {
            log: Arc::new(HookPoint::native("log", move |call: ConsoleCall| {
                log_buffer.lock().push(ConsoleLine {
                    method: "log",
                    args: call.args,
                });
            })),
            table: Arc::new(HookPoint::native("table", move |call: ConsoleCall| {
                table_buffer.lock().push(ConsoleLine {
                    method: "table",
                    args: call.args,
                });
            })),
            clear: Arc::new(HookPoint::native("clear", move |_: ()| {
                clear_buffer.lock().clear();
            })),
            buffer,
        }
    }

    /// Buffered output.
    pub fn lines(&self) -> Vec<ConsoleLine> {
        self.buffer.lock().clone()
    }

    /// Takes the buffered output.
    pub fn drain(&self) -> Vec<ConsoleLine> {
        std::mem::take(&mut *self.buffer.lock())
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("lines", &self.buffer.lock().len())
            .finish()
    }
}
