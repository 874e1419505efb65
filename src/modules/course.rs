//! The `course` module: learning activity pages.
//!
//! Two features rewrite the activity API response so the page unlocks
//! downloads and seeking; the other two drive the activity video using the
//! preferences of [`VideoSettingsStore`](crate::state::VideoSettingsStore).
//! All four are route-aware, since the platform navigates between
//! activities without reloading.

use crate::browser::{Element, Listener, ListenerOptions};
use crate::feature::{
    Cleanup, Cleanups, Feature, FeatureContext, FeatureError, FeatureModule, FeatureTest, ModuleI18n,
};
use crate::hook::{json_transform, UrlMatcher};
use crate::modules::wait_timeout_ms;
use crate::notify::{Notifier, ToastKind, ToastOptions};
use crate::services::Services;
use crate::state::Subscription;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Module id.
pub const COURSE_MODULE: &str = "course";

/// Pathname of learning activity pages.
pub const LEARNING_ACTIVITY_PATTERN: &str = r"^/course/\d+/learning-activity";

/// Pathname of the activity API.
pub const ACTIVITY_API_PATTERN: &str = r"^/api/activities/(\d+)/?$";

/// Button that opens the next activity.
pub const NEXT_ACTIVITY_BUTTON: &str = "button[ng-click=changeActivity(nextActivity)]";

const GROUP: &str = "learning-activity";

/// Builds the module.
pub fn course_module(services: Arc<Services>) -> Result<FeatureModule, FeatureError> {
    let i18n = ModuleI18n::from_json(include_str!("i18n/course.json"))?;
    FeatureModule::new(COURSE_MODULE, services)?
        .with_i18n(i18n)
        .with_feature(GROUP, force_allow_download()?)?
        .with_feature(GROUP, force_allow_forward_seeking()?)?
        .with_feature(GROUP, playback_rate()?)?
        .with_feature(GROUP, auto_next()?)
}

/// Sets every `key` holding `false` to `true`, at any depth.
///
/// Returns whether anything changed.
pub fn unlock_flag(value: &mut Value, key: &str) -> bool {
    match value {
        Value::Object(map) => {
            let mut changed = false;
            for (k, v) in map.iter_mut() {
                if k == key && *v == Value::Bool(false) {
                    *v = Value::Bool(true);
                    changed = true;
                } else {
                    changed |= unlock_flag(v, key);
                }
            }
            changed
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| unlock_flag(item, key) || changed),
        _ => false,
    }
}

fn activity_feature<C>(feature: Feature<C>) -> Result<Feature<C>, FeatureError> {
    Ok(feature
        .with_test(FeatureTest::pattern(LEARNING_ACTIVITY_PATTERN)?)
        .with_route_aware(true))
}

fn force_allow_download() -> Result<Feature<()>, FeatureError> {
    let feature = Feature::enable("forceAllowDownload", |ctx: FeatureContext<()>| async move {
        let notifier = ctx.services().notifier().clone();
        let transform = json_transform(move |body| {
            let changed = unlock_flag(body, "allow_download");
            if changed {
                notifier.show("Downloads unlocked", ToastOptions::kind(ToastKind::Success));
            }
            Ok(changed)
        });
        let controller = ctx
            .services()
            .requests()
            .register_request_hook(UrlMatcher::path(ACTIVITY_API_PATTERN)?, transform);
        Ok(Cleanups::new().with(controller))
    })
    .with_default_enabled(false);
    activity_feature(feature)
}

fn force_allow_forward_seeking() -> Result<Feature<()>, FeatureError> {
    let feature = Feature::enable("forceAllowForwardSeeking", |ctx: FeatureContext<()>| async move {
        let notifier = ctx.services().notifier().clone();
        let transform = json_transform(move |body| {
            if body.get("type").and_then(Value::as_str) == Some("interaction") {
                notifier.show(
                    "Interactive activities cannot be fast-forwarded",
                    ToastOptions::kind(ToastKind::Warning),
                );
                return Ok(false);
            }
            let changed = unlock_flag(body, "allow_forward_seeking");
            if changed {
                notifier.show("Fast-forward unlocked", ToastOptions::kind(ToastKind::Success));
            }
            Ok(changed)
        });
        let controller = ctx
            .services()
            .requests()
            .register_request_hook(UrlMatcher::path(ACTIVITY_API_PATTERN)?, transform);
        Ok(Cleanups::new().with(controller))
    })
    .with_default_enabled(false);
    activity_feature(feature)
}

async fn load_video_settings<C>(ctx: FeatureContext<C>, _value: bool) -> anyhow::Result<Cleanups> {
    ctx.services().video().init().await;
    Ok(Cleanups::new())
}

/// Scratch of `playbackRate`.
#[derive(Default)]
pub struct PlaybackScratch {
    video: Option<Element>,
    original_rate: Option<f64>,
    subscription: Option<Subscription>,
}

fn playback_rate() -> Result<Feature<PlaybackScratch>, FeatureError> {
    let feature = Feature::toggle(
        "playbackRate",
        |enabled, ctx: FeatureContext<PlaybackScratch>| async move {
            if !enabled {
                return Ok(Cleanups::new());
            }
            let attach = ctx.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = attach_playback_rate(&attach).await {
                    debug!("[playbackRate] {}: {}", attach.path(), e);
                }
            });
            Ok(Cleanups::new()
                .with(task)
                .with(Cleanup::labeled("restore-rate", move || restore_playback_rate(&ctx))))
        },
    )
    .with_setup(load_video_settings);
    activity_feature(feature)
}

async fn attach_playback_rate(ctx: &FeatureContext<PlaybackScratch>) -> anyhow::Result<()> {
    let services = ctx.services();
    let video = services
        .dom()
        .wait_for_element("video", wait_timeout_ms(services))
        .await?;
    let original = video.property_f64("playbackRate").unwrap_or(1.0);
    let rate = services.video().playback_rate();
    video.set_property("playbackRate", json!(rate));

    let target = video.clone();
    let subscription = services.video().state().subscribe(
        "playbackRate",
        move |change| {
            if let Some(rate) = change.value.as_f64() {
                target.set_property("playbackRate", json!(rate));
            }
        },
        false,
    );
    ctx.toast(&format!("Playback rate set to {}x", rate), ToastKind::Success);
    ctx.scratch(|s| {
        s.video = Some(video);
        s.original_rate = Some(original);
        s.subscription = Some(subscription);
    });
    Ok(())
}

fn restore_playback_rate(ctx: &FeatureContext<PlaybackScratch>) {
    let (video, original, subscription) =
        ctx.scratch(|s| (s.video.take(), s.original_rate.take(), s.subscription.take()));
    if let Some(subscription) = subscription {
        subscription.unsubscribe();
    }
    if let (Some(video), Some(original)) = (video, original) {
        video.set_property("playbackRate", json!(original));
    }
}

/// Scratch of `autoNext`.
#[derive(Default)]
pub struct AutoNextScratch {
    video: Option<Element>,
    listener: Option<Listener>,
}

fn auto_next() -> Result<Feature<AutoNextScratch>, FeatureError> {
    let feature = Feature::toggle(
        "autoNext",
        |enabled, ctx: FeatureContext<AutoNextScratch>| async move {
            if !enabled {
                return Ok(Cleanups::new());
            }
            let attach = ctx.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = attach_auto_next(&attach).await {
                    debug!("[autoNext] {}: {}", attach.path(), e);
                }
            });
            Ok(Cleanups::new().with(task).with(Cleanup::labeled("detach-auto-next", move || {
                let (video, listener) = ctx.scratch(|s| (s.video.take(), s.listener.take()));
                if let (Some(video), Some(listener)) = (video, listener) {
                    video.target().remove_event_listener(
                        "timeupdate",
                        &listener,
                        ListenerOptions::default(),
                    );
                }
            })))
        },
    )
    .with_setup(load_video_settings);
    activity_feature(feature)
}

async fn attach_auto_next(ctx: &FeatureContext<AutoNextScratch>) -> anyhow::Result<()> {
    let services = ctx.services().clone();
    let video = services
        .dom()
        .wait_for_element("video", wait_timeout_ms(&services))
        .await?;

    let fired = AtomicBool::new(false);
    let watched = video.clone();
    let listener = Listener::exempt(move |_| {
        let (Some(current), Some(duration)) = (
            watched.property_f64("currentTime"),
            watched.property_f64("duration"),
        ) else {
            return;
        };
        if duration <= 0.0 || !services.video().settings().auto_next {
            return;
        }
        if current / duration < services.video().custom_auto_next_threshold() {
            return;
        }
        if fired.swap(true, Ordering::SeqCst) {
            return;
        }
        match services.dom().query(NEXT_ACTIVITY_BUTTON) {
            Some(button) => {
                services.toast("Moving to the next activity", ToastOptions::kind(ToastKind::Info));
                button.click();
            }
            None => {
                fired.store(false, Ordering::SeqCst);
                debug!("[autoNext] next activity button not found");
            }
        }
    });
    video
        .target()
        .add_event_listener("timeupdate", listener.clone(), ListenerOptions::default());
    ctx.scratch(|s| {
        s.video = Some(video);
        s.listener = Some(listener);
    });
    Ok(())
}
