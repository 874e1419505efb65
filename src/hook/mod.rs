//! Interception Layer
//!
//! Low-level machinery that patches the page's built-in APIs on behalf of the
//! feature engine.
//!
//! # Modules
//!
//! - `point` - Hookable function slots with an ordered, revocable interceptor chain
//! - `realm` - Named property slots of the page's global objects
//! - `vault` - Native references captured before any patching
//! - `events` - Event-hook registry layered over `addEventListener`
//! - `request` - Response-body rewriting for `fetch` and `XMLHttpRequest`
//! - `devtool` - Devtools-detection countermeasures built on the primitives above
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tronclass_enhancer::browser::{Page, StaticTransport};
//! use tronclass_enhancer::hook::EventHookRegistry;
//!
//! let page = Page::new("https://tronclass.com.tw/user/index", Arc::new(StaticTransport::new())).unwrap();
//! let registry = Arc::new(EventHookRegistry::new());
//! registry.install(page.realm()).unwrap();
//! registry.install(page.realm()).unwrap(); // idempotent
//! assert_eq!(page.realm().interceptor_count("EventTarget.prototype", "addEventListener"), 1);
//! ```

pub mod devtool;
pub mod events;
pub mod point;
pub mod realm;
pub mod request;
pub mod vault;

pub use devtool::{
    block_devtool_shortcuts, disable_devtool_detector, is_devtool_shortcut, spoof_animation_frames,
    DevtoolOptions,
};
pub use events::{
    define_blocked_handler, BlockStrategy, BlockedEvents, EventHookController, EventHookRegistry,
    HookOptions, PreCallFn, PreHookFn,
};
pub use point::{HookId, HookPoint, NativeFn, Next, Unhook};
pub use realm::{Realm, Slot, SlotKey};
pub use request::{
    json_transform, RequestHookController, RequestHookRegistry, TransformFn, UrlMatcher,
    RESPONSE_MODIFIED_TOAST,
};
pub use vault::NativeVault;

use thiserror::Error;

/// Errors raised while installing a hook.
#[derive(Debug, Error)]
pub enum HookInstallError {
    /// The hooked property is not a function of the expected signature.
    #[error("Hook target {target}.{property} is not a function: {reason}")]
    InvalidHookTarget {
        /// Owning object.
        target: String,
        /// Property name.
        property: String,
        /// What was found instead.
        reason: String,
    },
}

impl HookInstallError {
    pub(crate) fn invalid(target: &str, property: &str, reason: impl Into<String>) -> Self {
        Self::InvalidHookTarget {
            target: target.to_string(),
            property: property.to_string(),
            reason: reason.into(),
        }
    }
}

/// Well-known slot addresses patched by this crate.
pub mod slots {
    /// `EventTarget.prototype`
    pub const EVENT_TARGET_PROTO: &str = "EventTarget.prototype";
    /// `XMLHttpRequest.prototype`
    pub const XHR_PROTO: &str = "XMLHttpRequest.prototype";
    /// `Document.prototype`
    pub const DOCUMENT_PROTO: &str = "Document.prototype";
    /// `window`
    pub const WINDOW: &str = "window";
    /// `console`
    pub const CONSOLE: &str = "console";
}
