//! The `global` module.
//!
//! | group        | feature                  | default |
//! |--------------|--------------------------|---------|
//! | `event-hook` | `copy`                   | on      |
//! | `event-hook` | `disable-devtool-detect` | on      |
//! | `event-hook` | `block-visibility`       | on      |
//! | `event-hook` | `keep-session-alive`     | off     |
//! | `style`      | `init-hide-scroll`       | on      |
//! | `footer`     | `hidden`                 | on      |
//! | `menu`       | `RWD-support`            | on      |

use crate::browser::{Element, Event, Listener, ListenerOptions, TargetKind};
use crate::feature::{Cleanup, Cleanups, Feature, FeatureContext, FeatureError, FeatureModule, ModuleI18n};
use crate::hook::{
    block_devtool_shortcuts, define_blocked_handler, disable_devtool_detector, slots,
    spoof_animation_frames, BlockStrategy, DevtoolOptions, HookOptions, Next,
};
use crate::modules::{wait_timeout_ms, MK_CUSTOM_COMPONENT, MK_HIDDEN_SCROLL_CLASS};
use crate::services::Services;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Module id.
pub const GLOBAL_MODULE: &str = "global";

/// Interval of the simulated activity of `keep-session-alive`.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Body class hiding the scrollbar until the window has loaded.
pub const INIT_HIDE_SCROLL_CLASS: &str = "mk-hidden-scroll-init";

/// Events stopped on the document by `copy`.
pub const COPY_EVENTS: [&str; 8] = [
    "contextmenu",
    "copy",
    "cut",
    "paste",
    "drag",
    "dragstart",
    "select",
    "selectstart",
];

/// Events stopped on the window by `block-visibility`.
pub const VISIBILITY_EVENTS: [&str; 9] = [
    "visibilitychange",
    "webkitvisibilitychange",
    "mozvisibilitychange",
    "msvisibilitychange",
    "fullscreenchange",
    "webkitfullscreenchange",
    "mozfullscreenchange",
    "MSFullscreenChange",
    "focus",
];

const LAYOUT_SELECTOR: &str = ".layout-row.default-layout";
const OPEN_MENU_CLASS: &str = "mk-open-menu";

const COPY_CSS: &str = "*:not(.mk-custom-component) { user-select: text !important; -webkit-user-select: text !important; }";

const FOOTER_CSS: &str = ".main-content { padding-bottom: 0 !important; }\n\
[data-category=tronclass-footer] { display: none !important; }";

const HIDE_SCROLL_CSS: &str = "body.mk-hidden-scroll, body.mk-hidden-scroll-init { overflow: hidden !important; }";

const RWD_MENU_CSS: &str = ".custom-layout { display: none; }\n\
@media (max-width: 920px) {\n\
  .layout-row.default-layout > li, .layout-row.default-layout > ul { display: none !important; }\n\
  .custom-layout { display: block; position: relative; }\n\
  .custom-layout.mk-open-menu .custom-drop-menu { display: flex; flex-direction: column; }\n\
}";

/// Builds the module.
pub fn global_module(services: Arc<Services>) -> Result<FeatureModule, FeatureError> {
    let i18n = ModuleI18n::from_json(include_str!("i18n/global.json"))?;
    FeatureModule::new(GLOBAL_MODULE, services)?
        .with_i18n(i18n)
        .with_feature("event-hook", copy())?
        .with_feature("event-hook", disable_devtool_detect())?
        .with_feature("event-hook", block_visibility())?
        .with_feature("event-hook", keep_session_alive())?
        .with_feature("style", init_hide_scroll())?
        .with_feature("footer", hidden_footer())?
        .with_feature("menu", rwd_menu())
}

fn copy() -> Feature<()> {
    Feature::enable("copy", |ctx: FeatureContext<()>| async move {
        let services = ctx.services();
        let style = services.dom().create_style(COPY_CSS);
        let blocked = services.events().block_events(
            &COPY_EVENTS,
            ctx.page().document().target(),
            BlockStrategy::Propagation,
        );
        Ok(Cleanups::new().with(style).with(blocked))
    })
}

fn disable_devtool_detect() -> Feature<()> {
    Feature::enable("disable-devtool-detect", |ctx: FeatureContext<()>| async move {
        let page = ctx.page();
        let mut cleanups: Cleanups =
            disable_devtool_detector(page.realm(), page.vault(), DevtoolOptions::default())?
                .into_iter()
                .collect();
        cleanups.push(spoof_animation_frames(page.realm(), page.vault())?);
        for controller in block_devtool_shortcuts(ctx.services().events(), page.is_mac()) {
            cleanups.push(controller);
        }
        Ok(cleanups)
    })
    .with_live_reload(false)
}

fn block_visibility() -> Feature<()> {
    Feature::enable("block-visibility", |ctx: FeatureContext<()>| async move {
        let page = ctx.page();
        let realm = page.realm();
        let mut cleanups = Cleanups::new();
        cleanups.push(realm.override_getter(slots::DOCUMENT_PROTO, "hidden", || false)?);
        cleanups.push(realm.override_getter(slots::DOCUMENT_PROTO, "visibilityState", || {
            "visible".to_string()
        })?);
        cleanups.push(realm.hook(
            slots::DOCUMENT_PROTO,
            "hasFocus",
            |_: (), _next: Next<(), bool>| true,
        )?);
        cleanups.push(ctx.services().events().block_events(
            &VISIBILITY_EVENTS,
            page.window(),
            BlockStrategy::Propagation,
        ));

        // Only window and document blur listeners are muted.
        cleanups.push(ctx.services().events().register_hook(
            "blur",
            HookOptions::always().pre_hook(|call| {
                matches!(call.target.kind(), TargetKind::Window | TargetKind::Document)
            }),
        ));
        define_blocked_handler(page.window(), "blur");
        let window = page.window().clone();
        cleanups.push(Cleanup::labeled("unblock-onblur", move || {
            window.unblock_handler("blur")
        }));
        Ok(cleanups)
    })
}

fn keep_session_alive() -> Feature<()> {
    Feature::enable("keep-session-alive", |ctx: FeatureContext<()>| async move {
        let page = ctx.page().clone();
        let vault = page.vault();
        let task = tokio::spawn(async move {
            loop {
                vault.sleep(KEEP_ALIVE_INTERVAL).await;
                page.document().target().dispatch_event(&Event::new("mousemove"));
            }
        });
        Ok(Cleanups::new().with(task))
    })
    .with_default_enabled(false)
}

fn init_hide_scroll() -> Feature<()> {
    Feature::enable("init-hide-scroll", |ctx: FeatureContext<()>| async move {
        let page = ctx.page();
        let style = ctx.services().dom().create_style(HIDE_SCROLL_CSS);
        let body = page.document().body().clone();
        body.add_class(INIT_HIDE_SCROLL_CLASS);

        let loaded = body.clone();
        let on_load = Listener::exempt(move |_| loaded.remove_class(INIT_HIDE_SCROLL_CLASS));
        page.window()
            .add_event_listener("load", on_load.clone(), ListenerOptions::once());

        let window = page.window().clone();
        Ok(Cleanups::new().with(style).with(Cleanup::labeled(
            "show-scroll",
            move || {
                window.remove_event_listener("load", &on_load, ListenerOptions::once());
                body.remove_class(INIT_HIDE_SCROLL_CLASS);
            },
        )))
    })
}

fn hidden_footer() -> Feature<()> {
    Feature::enable("hidden", |ctx: FeatureContext<()>| async move {
        Ok(Cleanups::new().with(ctx.services().dom().create_style(FOOTER_CSS)))
    })
    .with_route_aware(true)
}

fn rwd_menu() -> Feature<()> {
    Feature::enable("RWD-support", |ctx: FeatureContext<()>| async move {
        let services = ctx.services().clone();
        let style = services.dom().create_style(RWD_MENU_CSS);
        let task = tokio::spawn(async move {
            match services
                .dom()
                .wait_for_element(LAYOUT_SELECTOR, wait_timeout_ms(&services))
                .await
            {
                Ok(layout) => build_drop_menu(&services, &layout),
                Err(e) => debug!("Responsive menu skipped: {}", e),
            }
        });
        Ok(Cleanups::new().with(task).with(style))
    })
    .with_live_reload(false)
}

/// Moves the header entries into a drop-down toggled by a button.
fn build_drop_menu(services: &Services, layout: &Element) {
    let dom = services.dom();
    let container = dom.create_element("div", &[MK_CUSTOM_COMPONENT, "custom-layout"]);
    let button = dom.create_element("div", &[MK_CUSTOM_COMPONENT, "custom-drop-button"]);
    let menu = dom.create_element("div", &[MK_CUSTOM_COMPONENT, "custom-drop-menu"]);

    let entries: Vec<Element> = layout
        .children()
        .into_iter()
        .filter(|child| matches!(child.tag(), "li" | "ul"))
        .collect();
    for entry in &entries {
        menu.append_child(entry);
    }
    container.append_child(&button);
    container.append_child(&menu);
    layout.append_child(&container);

    let toggled = container.clone();
    let body = services.page().document().body().clone();
    button.target().add_event_listener(
        "click",
        Listener::exempt(move |_| {
            if toggled.has_class(OPEN_MENU_CLASS) {
                toggled.remove_class(OPEN_MENU_CLASS);
                body.remove_class(MK_HIDDEN_SCROLL_CLASS);
            } else {
                toggled.add_class(OPEN_MENU_CLASS);
                body.add_class(MK_HIDDEN_SCROLL_CLASS);
            }
        }),
        ListenerOptions::default(),
    );
    debug!("Responsive menu built with {} entries", entries.len());
}
