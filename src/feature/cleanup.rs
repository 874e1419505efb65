//! Cleanup callbacks returned by feature activations.
//!
//! A step is either a plain closure or a closure returning a future. Steps
//! run strictly in order; an asynchronous step is awaited before the next
//! one starts.

use crate::browser::StyleHandle;
use crate::hook::{BlockedEvents, EventHookController, RequestHookController, Unhook};
use crate::state::Subscription;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::task::JoinHandle;
use tracing::error;

enum Step {
    Sync(Box<dyn FnOnce() + Send>),
    Async(Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>),
}

/// One undo step.
pub struct Cleanup {
    label: &'static str,
    step: Step,
}

impl Cleanup {
    /// Wraps a closure.
    pub fn new<F>(run: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::labeled("fn", run)
    }

    /// Wraps a closure with a label shown in logs.
    pub fn labeled<F>(label: &'static str, run: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            label,
            step: Step::Sync(Box::new(run)),
        }
    }

    /// Wraps an asynchronous undo, awaited before the next step runs.
    pub fn future<F, Fut>(run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::labeled_future("future", run)
    }

    /// [`Cleanup::future`] with a label shown in logs.
    pub fn labeled_future<F, Fut>(label: &'static str, run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            label,
            step: Step::Async(Box::new(move || run().boxed())),
        }
    }

    /// Label shown in logs.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Whether the step returns a future.
    pub fn is_async(&self) -> bool {
        matches!(self.step, Step::Async(_))
    }

    /// Runs the step to completion.
    pub async fn run(self) {
        match self.step {
            Step::Sync(run) => run(),
            Step::Async(start) => start().await,
        }
    }

    /// Runs the step, reporting a panic as `Err`.
    async fn run_caught(self) -> Result<(), ()> {
        match self.step {
            Step::Sync(run) => catch_unwind(AssertUnwindSafe(run)).map_err(|_| ()),
            Step::Async(start) => match catch_unwind(AssertUnwindSafe(start)) {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await.map_err(|_| ()),
                Err(_) => Err(()),
            },
        }
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cleanup").field(&self.label).finish()
    }
}

impl From<Unhook> for Cleanup {
    fn from(unhook: Unhook) -> Self {
        Cleanup::labeled("unhook", move || {
            unhook.unhook();
        })
    }
}

impl From<BlockedEvents> for Cleanup {
    fn from(blocked: BlockedEvents) -> Self {
        Cleanup::labeled("blocked-events", move || blocked.release())
    }
}

impl From<StyleHandle> for Cleanup {
    fn from(style: StyleHandle) -> Self {
        Cleanup::labeled("style", move || style.remove())
    }
}

impl From<EventHookController> for Cleanup {
    fn from(controller: EventHookController) -> Self {
        Cleanup::labeled("event-hook", move || controller.disable())
    }
}

/// Disables the hook. The entry stays registered, like event hook entries.
impl From<RequestHookController> for Cleanup {
    fn from(controller: RequestHookController) -> Self {
        Cleanup::labeled("request-hook", move || controller.disable())
    }
}

impl From<Subscription> for Cleanup {
    fn from(subscription: Subscription) -> Self {
        Cleanup::labeled("subscription", move || subscription.unsubscribe())
    }
}

impl From<JoinHandle<()>> for Cleanup {
    fn from(task: JoinHandle<()>) -> Self {
        Cleanup::labeled("task", move || task.abort())
    }
}

/// Ordered undo steps of one activation.
#[derive(Debug, Default)]
pub struct Cleanups {
    steps: Vec<Cleanup>,
}

impl Cleanups {
    /// No cleanups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Cleanups::push`].
    pub fn with(mut self, step: impl Into<Cleanup>) -> Self {
        self.push(step);
        self
    }

    /// Appends a step.
    pub fn push(&mut self, step: impl Into<Cleanup>) {
        self.steps.push(step.into());
    }

    /// Moves every step of `other` to the end of `self`.
    pub fn append(&mut self, mut other: Cleanups) {
        self.steps.append(&mut other.steps);
    }

    /// Takes every step, leaving `self` empty.
    pub fn take(&mut self) -> Cleanups {
        Cleanups {
            steps: std::mem::take(&mut self.steps),
        }
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether there are no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every step in order, awaiting asynchronous steps before the next
    /// one starts. A panicking step is logged and the rest still run.
    ///
    /// Returns the number of steps that panicked.
    pub async fn run_all(self, owner: &str) -> usize {
        let mut failures = 0;
        for step in self.steps {
            let label = step.label();
            if step.run_caught().await.is_err() {
                error!("[Feature:cleanup] {} ({}) panicked", owner, label);
                failures += 1;
            }
        }
        failures
    }
}

impl From<Cleanup> for Cleanups {
    fn from(step: Cleanup) -> Self {
        Cleanups { steps: vec![step] }
    }
}

impl<T: Into<Cleanup>> FromIterator<T> for Cleanups {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Cleanups {
            steps: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{Page, StaticTransport};
    use crate::hook::UrlMatcher;
    use crate::services::Services;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_all_in_order_despite_panics() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (log.clone(), log.clone());
        let cleanups = Cleanups::new()
            .with(Cleanup::new(move || a.lock().push(1)))
            .with(Cleanup::labeled("broken", || panic!("boom")))
            .with(Cleanup::new(move || b.lock().push(3)));

        assert_eq!(cleanups.len(), 3);
        assert_eq!(cleanups.run_all("test.group.feature").await, 1);
        assert_eq!(*log.lock(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_async_step_completes_before_next_step() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        let cleanups = Cleanups::new()
            .with(Cleanup::future(move || async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                a.lock().push("slow");
            }))
            .with(Cleanup::labeled_future("broken", || async { panic!("boom") }))
            .with(Cleanup::new(move || b.lock().push("sync")))
            .with(Cleanup::future(move || async move { c.lock().push("fast") }));

        assert_eq!(cleanups.run_all("test.group.feature").await, 1);
        assert_eq!(*log.lock(), vec!["slow", "sync", "fast"]);
    }

    #[tokio::test]
    async fn test_request_hook_cleanup_disables_entry() {
        let page = Page::new("https://lms.example.edu/", Arc::new(StaticTransport::new())).unwrap();
        let services = Services::new(page).unwrap();
        let requests = services.requests();
        let controller = requests.register_request_hook(
            UrlMatcher::path("^/api/").unwrap(),
            Arc::new(|_: &str| -> anyhow::Result<Option<String>> { Ok(Some("{}".to_string())) }),
        );
        let cleanup = Cleanup::from(controller);
        assert!(!cleanup.is_async());

        cleanup.run().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests.run_request_hooks("/api/x", "[]"), "[]");
    }

    #[test]
    fn test_take_empties() {
        let mut cleanups: Cleanups = vec![Cleanup::new(|| {})].into_iter().collect();
        let taken = cleanups.take();
        assert!(cleanups.is_empty());
        assert_eq!(taken.len(), 1);
    }
}
