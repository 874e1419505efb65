//! User notifications.
//!
//! Features report outcomes through a [`Notifier`]. Delivery is best-effort:
//! a notifier never fails and its absence never affects feature logic.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

/// Visual kind of a toast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastKind {
    /// Neutral information.
    #[default]
    Info,
    /// Success confirmation.
    Success,
    /// Something was refused or skipped.
    Warning,
    /// A failure.
    Error,
}

/// Options of a toast.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToastOptions {
    /// Visual kind.
    pub kind: ToastKind,
    /// How long the toast stays visible.
    pub duration: Option<Duration>,
    /// Secondary text.
    pub description: Option<String>,
}

impl ToastOptions {
    /// Options of the given kind.
    pub fn kind(kind: ToastKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Sets the duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Side channel for user feedback.
pub trait Notifier: Send + Sync {
    /// Shows a toast. Fire-and-forget.
    fn show(&self, message: &str, options: ToastOptions);
}

/// Notifier writing toasts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn show(&self, message: &str, options: ToastOptions) {
        let description = options.description.as_deref().unwrap_or("");
        match options.kind {
            ToastKind::Info | ToastKind::Success => info!("[toast] {} {}", message, description),
            ToastKind::Warning => warn!("[toast] {} {}", message, description),
            ToastKind::Error => error!("[toast] {} {}", message, description),
        }
    }
}

/// Notifier remembering every toast, for tests and the simulator.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    toasts: Mutex<Vec<(String, ToastOptions)>>,
}

impl RecordingNotifier {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toasts shown so far.
    pub fn toasts(&self) -> Vec<(String, ToastOptions)> {
        self.toasts.lock().clone()
    }

    /// Messages shown so far.
    pub fn messages(&self) -> Vec<String> {
        self.toasts.lock().iter().map(|(m, _)| m.clone()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn show(&self, message: &str, options: ToastOptions) {
        self.toasts.lock().push((message.to_string(), options));
    }
}
