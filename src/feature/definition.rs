//! Declarative feature definitions.
//!
//! A [`Feature`] is built once with one of the constructors below, which
//! fixes its [`FeatureKind`]. The engine never re-derives the kind from
//! which callbacks happen to be present.
//!
//! # Example
//!
//! ```rust
//! use tronclass_enhancer::feature::{Cleanups, Feature, FeatureTest};
//!
//! let feature = Feature::<()>::enable("copy", |ctx| async move {
//!     let style = ctx.services().dom().create_style("* { user-select: text !important; }");
//!     Ok(Cleanups::new().with(style))
//! })
//! .with_test(FeatureTest::Always);
//! assert!(feature.live_reload());
//! ```

use crate::browser::RouteInfo;
use crate::feature::cleanup::Cleanups;
use crate::feature::context::FeatureContext;
use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Result of an activation callback.
pub type CallbackFuture = BoxFuture<'static, anyhow::Result<Cleanups>>;

/// `enable`, `disable` or `click`.
pub type ActionFn<C> = Arc<dyn Fn(FeatureContext<C>) -> CallbackFuture + Send + Sync>;

/// `toggle(new_value, ctx)`.
pub type ToggleFn<C> = Arc<dyn Fn(bool, FeatureContext<C>) -> CallbackFuture + Send + Sync>;

/// `setup(ctx, current_value)`.
pub type SetupFn<C> = Arc<dyn Fn(FeatureContext<C>, bool) -> CallbackFuture + Send + Sync>;

/// Async applicability predicate.
pub type TestFn = Arc<dyn Fn(RouteInfo) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Route predicate of [`RouteAware::When`].
pub type RouteFn = Arc<dyn Fn(&RouteInfo) -> bool + Send + Sync>;

/// Decides whether a feature applies to the current page.
#[derive(Clone, Default)]
pub enum FeatureTest {
    /// Applies everywhere.
    #[default]
    Always,
    /// Applies when the pathname matches.
    Pattern(Regex),
    /// Applies when the predicate resolves to `true`.
    Predicate(TestFn),
}

impl FeatureTest {
    /// Pathname pattern.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(FeatureTest::Pattern(Regex::new(pattern)?))
    }

    /// Async predicate over the current route.
    pub fn predicate<F, Fut>(predicate: F) -> Self
    where
        F: Fn(RouteInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        FeatureTest::Predicate(Arc::new(move |route| predicate(route).boxed()))
    }

    /// Evaluates the test against `route`. Never cached.
    pub async fn evaluate(&self, route: &RouteInfo) -> anyhow::Result<bool> {
        match self {
            FeatureTest::Always => Ok(true),
            FeatureTest::Pattern(regex) => Ok(regex.is_match(&route.pathname)),
            FeatureTest::Predicate(predicate) => predicate(route.clone()).await,
        }
    }
}

impl fmt::Debug for FeatureTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureTest::Always => f.write_str("Always"),
            FeatureTest::Pattern(regex) => f.debug_tuple("Pattern").field(&regex.as_str()).finish(),
            FeatureTest::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Whether route changes re-evaluate a feature.
#[derive(Clone, Default)]
pub enum RouteAware {
    /// Route changes never touch the feature.
    #[default]
    Never,
    /// Every route change re-evaluates the feature.
    Always,
    /// Route changes re-evaluate the feature when the predicate holds.
    When(RouteFn),
}

impl RouteAware {
    /// Predicate form.
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&RouteInfo) -> bool + Send + Sync + 'static,
    {
        RouteAware::When(Arc::new(predicate))
    }

    /// Whether a change to `route` should re-evaluate the feature.
    pub fn applies(&self, route: &RouteInfo) -> bool {
        match self {
            RouteAware::Never => false,
            RouteAware::Always => true,
            RouteAware::When(predicate) => predicate(route),
        }
    }

    /// Whether the feature takes part in route re-evaluation at all.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, RouteAware::Never)
    }
}

impl From<bool> for RouteAware {
    fn from(value: bool) -> Self {
        if value {
            RouteAware::Always
        } else {
            RouteAware::Never
        }
    }
}

impl fmt::Debug for RouteAware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteAware::Never => f.write_str("Never"),
            RouteAware::Always => f.write_str("Always"),
            RouteAware::When(_) => f.write_str("When(..)"),
        }
    }
}

/// Activation contract of a feature.
pub enum FeatureKind<C> {
    /// Only `setup` runs.
    SetupOnly,
    /// `toggle(new_value)` runs on every transition.
    Toggle(ToggleFn<C>),
    /// `enable` on true, `disable` on false. A missing callback does nothing.
    EnableDisable {
        /// Runs when switching on.
        enable: Option<ActionFn<C>>,
        /// Runs when switching off.
        disable: Option<ActionFn<C>>,
    },
    /// A one-shot action with no persisted flag.
    Click(ActionFn<C>),
}

impl<C> FeatureKind<C> {
    /// Short name used in logs and the CLI.
    pub fn name(&self) -> &'static str {
        match self {
            FeatureKind::SetupOnly => "setup",
            FeatureKind::Toggle(_) => "toggle",
            FeatureKind::EnableDisable { .. } => "enable/disable",
            FeatureKind::Click(_) => "click",
        }
    }

    /// Whether the feature carries a persisted flag.
    pub fn is_persisted(&self) -> bool {
        !matches!(self, FeatureKind::Click(_))
    }
}

fn action<C, F, Fut>(f: F) -> ActionFn<C>
where
    F: Fn(FeatureContext<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Cleanups>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// One togglable unit.
pub struct Feature<C> {
    id: String,
    test: FeatureTest,
    setup: Option<SetupFn<C>>,
    kind: FeatureKind<C>,
    live_reload: bool,
    route_aware: RouteAware,
    experimental: bool,
    default_enabled: bool,
}

impl<C> Feature<C> {
    fn with_kind(id: impl Into<String>, kind: FeatureKind<C>) -> Self {
        Self {
            id: id.into(),
            test: FeatureTest::Always,
            setup: None,
            kind,
            live_reload: true,
            route_aware: RouteAware::Never,
            experimental: false,
            default_enabled: true,
        }
    }

    /// A feature whose only behaviour is `setup`.
    pub fn setup_only<F, Fut>(id: impl Into<String>, setup: F) -> Self
    where
        F: Fn(FeatureContext<C>, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Cleanups>> + Send + 'static,
    {
        Self::with_kind(id, FeatureKind::SetupOnly).with_setup(setup)
    }

    /// A feature driven by `toggle(new_value)`.
    pub fn toggle<F, Fut>(id: impl Into<String>, toggle: F) -> Self
    where
        F: Fn(bool, FeatureContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Cleanups>> + Send + 'static,
    {
        let toggle: ToggleFn<C> = Arc::new(move |value, ctx| toggle(value, ctx).boxed());
        Self::with_kind(id, FeatureKind::Toggle(toggle))
    }

    /// A feature driven by `enable`, optionally paired with [`Feature::with_disable`].
    pub fn enable<F, Fut>(id: impl Into<String>, enable: F) -> Self
    where
        F: Fn(FeatureContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Cleanups>> + Send + 'static,
    {
        Self::with_kind(
            id,
            FeatureKind::EnableDisable {
                enable: Some(action(enable)),
                disable: None,
            },
        )
    }

    /// A one-shot action.
    pub fn click<F, Fut>(id: impl Into<String>, click: F) -> Self
    where
        F: Fn(FeatureContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Cleanups>> + Send + 'static,
    {
        Self::with_kind(id, FeatureKind::Click(action(click)))
    }

    /// Adds the `disable` half of an enable/disable feature.
    ///
    /// Turns any other kind except click into an enable/disable feature with
    /// no `enable`.
    pub fn with_disable<F, Fut>(mut self, disable: F) -> Self
    where
        F: Fn(FeatureContext<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Cleanups>> + Send + 'static,
    {
        let disable = Some(action(disable));
        self.kind = match self.kind {
            FeatureKind::EnableDisable { enable, .. } => FeatureKind::EnableDisable { enable, disable },
            FeatureKind::Click(click) => FeatureKind::Click(click),
            _ => FeatureKind::EnableDisable { enable: None, disable },
        };
        self
    }

    /// Adds a `setup` that runs once, on the first applicable transition.
    pub fn with_setup<F, Fut>(mut self, setup: F) -> Self
    where
        F: Fn(FeatureContext<C>, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Cleanups>> + Send + 'static,
    {
        self.setup = Some(Arc::new(move |ctx, value| setup(ctx, value).boxed()));
        self
    }

    /// Sets the applicability test.
    pub fn with_test(mut self, test: FeatureTest) -> Self {
        self.test = test;
        self
    }

    /// Whether toggles apply immediately (default) or on the next init.
    pub fn with_live_reload(mut self, live_reload: bool) -> Self {
        self.live_reload = live_reload;
        self
    }

    /// Sets route-change participation.
    pub fn with_route_aware(mut self, route_aware: impl Into<RouteAware>) -> Self {
        self.route_aware = route_aware.into();
        self
    }

    /// Marks the feature experimental.
    pub fn experimental(mut self) -> Self {
        self.experimental = true;
        self
    }

    /// Default of the persisted flag (`true` unless changed).
    pub fn with_default_enabled(mut self, enabled: bool) -> Self {
        self.default_enabled = enabled;
        self
    }

    /// Feature id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Applicability test.
    pub fn test(&self) -> &FeatureTest {
        &self.test
    }

    /// Optional setup.
    pub fn setup(&self) -> Option<&SetupFn<C>> {
        self.setup.as_ref()
    }

    /// Activation contract.
    pub fn kind(&self) -> &FeatureKind<C> {
        &self.kind
    }

    /// Whether toggles apply immediately.
    pub fn live_reload(&self) -> bool {
        self.live_reload
    }

    /// Route-change participation.
    pub fn route_aware(&self) -> &RouteAware {
        &self.route_aware
    }

    /// Whether the feature is experimental.
    pub fn is_experimental(&self) -> bool {
        self.experimental
    }

    /// Default of the persisted flag.
    pub fn default_enabled(&self) -> bool {
        self.default_enabled
    }
}

impl<C> fmt::Debug for Feature<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feature")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("test", &self.test)
            .field("live_reload", &self.live_reload)
            .field("route_aware", &self.route_aware)
            .field("experimental", &self.experimental)
            .finish()
    }
}
