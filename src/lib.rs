//! # TronClass Enhancer
//!
//! A feature engine for the TronClass learning platform, written in Rust.
//!
//! The crate patches a page's built-in APIs (event listeners, `fetch`,
//! `XMLHttpRequest`, console, visibility) through revocable hooks and runs
//! user-toggleable features on top of them. Feature flags are persisted per
//! module, and route-aware features are re-evaluated on in-app navigation.
//!
//! ## Features
//!
//! - **Hook Primitive**: Ordered, individually revocable interceptor chains on page APIs
//! - **Event Hooks**: Suppress page listeners per event type, block inline handlers
//! - **Request Hooks**: Rewrite JSON response bodies of `fetch` and `XMLHttpRequest`
//! - **Persistent State**: Keyed documents with change subscriptions and storage backends
//! - **Feature Lifecycle**: Toggle, enable/disable and click features with cleanups
//! - **Route Watcher**: Debounced and throttled re-evaluation on navigation
//! - **Flexible Configuration**: TOML/JSON files, environment variables, CLI arguments
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tronclass_enhancer::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = EnhancerSettings::default()
//!         .with_page_url("https://lms.example.edu/course/12/learning-activity");
//!
//!     let page = Page::new(&settings.page_url, Arc::new(StaticTransport::new()))?;
//!     let services = Services::new(page)?.with_dom_wait_timeout(settings.dom_wait_timeout());
//!     services.install_hooks()?;
//!
//!     let manager = Arc::new(FeatureManager::new(Arc::new(services)));
//!     register_builtin_modules(&manager)?;
//!     manager.init_all().await;
//!     manager.start_route_watcher();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`browser`]: Page model: event targets, DOM, location, network, console
//! - [`hook`]: Hook primitive, native vault, event and request hook registries
//! - [`state`]: Keyed and persistent state, storage backends, video preferences
//! - [`feature`]: Feature definitions, lifecycle, modules and the manager
//! - [`modules`]: Built-in `global`, `course` and `exam` modules
//! - [`services`]: Shared per-page collaborators handed to features
//! - [`notify`]: Toast notifications
//! - [`config`]: Configuration loading and management
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       FeatureManager                            │
//! │        ┌──────────────┬──────────────┬──────────────┐           │
//! │        │    global    │    course    │     exam     │  modules  │
//! │        └──────┬───────┴──────┬───────┴──────┬───────┘           │
//! │               └──────────────┼──────────────┘                   │
//! │                        ┌─────┴─────┐                            │
//! │                        │ Services  │──── state / notify         │
//! │                        └─────┬─────┘                            │
//! │        ┌─────────────────────┼─────────────────────┐            │
//! │  ┌─────┴─────┐        ┌──────┴──────┐       ┌──────┴──────┐     │
//! │  │  Event    │        │  Request    │       │  Devtool    │     │
//! │  │  Hooks    │        │  Hooks      │       │  Counter    │     │
//! │  └─────┬─────┘        └──────┬──────┘       └──────┬──────┘     │
//! │        └─────────────────────┼─────────────────────┘            │
//! │                     ┌────────┴────────┐                         │
//! │                     │ Realm / Page    │                         │
//! │                     └─────────────────┘                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//!
//! Configuration follows a precedence chain:
//! 1. Default values
//! 2. Configuration file (TOML/JSON)
//! 3. Environment variables (`TC_ENHANCER_*`)
//! 4. CLI arguments
//!
//! See [`config::EnhancerSettings`] for all available options.

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Full version string with name
pub const FULL_VERSION: &str = concat!(env!("CARGO_PKG_NAME"), " v", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Module Exports
// ============================================================================

/// Page model: event targets, DOM, location, history, network and console.
pub mod browser;

/// Hook primitive, native vault, and the event and request hook registries.
pub mod hook;

/// Keyed state, persistent state and storage backends.
pub mod state;

/// Feature registration and lifecycle engine.
pub mod feature;

/// Built-in feature modules.
pub mod modules;

/// Per-page collaborators shared by features.
pub mod services;

/// Toast notifications.
pub mod notify;

/// Configuration management for loading settings from files, env, and CLI.
pub mod config;

// ============================================================================
// Re-exports for Convenience
// ============================================================================

// Page types
pub use browser::{
    DomAccessor, Element, Event, EventTarget, Listener, ListenerOptions, Page, RouteInfo,
    StaticTransport,
};

// Hook types
pub use hook::{
    BlockStrategy, EventHookRegistry, HookInstallError, HookOptions, NativeVault, Realm,
    RequestHookRegistry, Unhook, UrlMatcher,
};

// State types
pub use state::{
    FileStorage, KeyedState, MemoryStorage, PersistentState, StateError, StorageBackend,
    VideoSettingsStore,
};

// Feature types
pub use feature::{
    Cleanup, Cleanups, Feature, FeatureContext, FeatureError, FeatureManager, FeatureModule,
    FeatureTest, RouteAware,
};

// Collaborators
pub use modules::register_builtin_modules;
pub use notify::{Notifier, ToastKind, ToastOptions};
pub use services::Services;

// Config types
pub use config::{CliArgs, ConfigError, EnhancerSettings};

// ============================================================================
// Prelude Module
// ============================================================================

/// Prelude module for convenient imports.
///
/// ```rust
/// use tronclass_enhancer::prelude::*;
/// ```
pub mod prelude {
    pub use crate::browser::{Page, StaticTransport};
    pub use crate::config::{CliArgs, EnhancerSettings};
    pub use crate::feature::{Cleanups, Feature, FeatureContext, FeatureManager, FeatureModule};
    pub use crate::modules::register_builtin_modules;
    pub use crate::services::Services;
    pub use crate::{FULL_VERSION, NAME, VERSION};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constants() {
        assert!(!VERSION.is_empty());
        assert!(!NAME.is_empty());
        assert!(FULL_VERSION.contains(VERSION));
        assert!(FULL_VERSION.contains(NAME));
    }

    #[test]
    fn test_prelude_imports() {
        // Verify prelude types are accessible
        use crate::prelude::*;
        let _ = VERSION;
        let _ = NAME;
        let _ = EnhancerSettings::default();
    }
}
