//! Built-in feature modules.
//!
//! - [`global`] - Tweaks applied on every page
//! - [`course`] - Learning activity pages: request rewriting and video helpers
//! - [`exam`] - Exam pages
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tronclass_enhancer::browser::{Page, StaticTransport};
//! use tronclass_enhancer::feature::FeatureManager;
//! use tronclass_enhancer::modules::register_builtin_modules;
//! use tronclass_enhancer::services::Services;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let page = Page::new("https://lms.example.edu/user/index", Arc::new(StaticTransport::new()))?;
//!     let services = Arc::new(Services::new(page)?);
//!     services.install_hooks()?;
//!
//!     let manager = Arc::new(FeatureManager::new(services));
//!     register_builtin_modules(&manager)?;
//!     manager.init_all().await;
//!     Ok(())
//! }
//! ```

pub mod course;
pub mod exam;
pub mod global;

use crate::feature::{FeatureError, FeatureManager, FeatureModule};
use crate::services::Services;
use std::sync::Arc;

/// Class marking elements created by this crate.
pub const MK_CUSTOM_COMPONENT: &str = "mk-custom-component";

/// Body class that hides the page scrollbar.
pub const MK_HIDDEN_SCROLL_CLASS: &str = "mk-hidden-scroll";

/// Registers `global`, `course` and `exam` in that order.
pub fn register_builtin_modules(
    manager: &FeatureManager,
) -> Result<Vec<Arc<FeatureModule>>, FeatureError> {
    let services = manager.services().clone();
    Ok(vec![
        manager.register(global::global_module(services.clone())?),
        manager.register(course::course_module(services.clone())?),
        manager.register(exam::exam_module(services)?),
    ])
}

pub(crate) fn wait_timeout_ms(services: &Services) -> u64 {
    u64::try_from(services.dom_wait_timeout().as_millis()).unwrap_or(u64::MAX)
}
