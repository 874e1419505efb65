//! Native-reference vault.
//!
//! Captured once, when the page is created and before anything can patch it.
//! Holds the untouched implementation of every method slot in the realm, their
//! native source text, the page clock (`performance.now`) and timers
//! (`setTimeout`). Calls made through the vault are immune to interceptors
//! installed afterwards.

use crate::hook::point::NativeFn;
use crate::hook::realm::{Realm, SlotKey};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

struct CapturedNative {
    source: String,
    native: Arc<dyn Any + Send + Sync>,
}

/// Frozen references to the page's built-ins.
pub struct NativeVault {
    time_origin: Instant,
    natives: HashMap<SlotKey, CapturedNative>,
}

impl NativeVault {
    /// Captures every method slot currently defined in the realm.
    pub fn capture(realm: &Realm) -> Self {
        let natives = realm
            .erased_points()
            .into_iter()
            .map(|(key, point)| {
                let captured = CapturedNative {
                    source: point.source().to_string(),
                    native: point.native_any(),
                };
                (key, captured)
            })
            .collect();

        Self {
            time_origin: Instant::now(),
            natives,
        }
    }

    /// Milliseconds since the vault was captured (`performance.now()`).
    pub fn now(&self) -> f64 {
        self.time_origin.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the bound native implementation of a method slot.
    ///
    /// `None` if the slot was not captured or has another signature.
    pub fn bound<A: 'static, R: 'static>(
        &self,
        target: &str,
        property: &str,
    ) -> Option<NativeFn<A, R>> {
        self.natives
            .get(&SlotKey::new(target, property))
            .and_then(|captured| captured.native.downcast_ref::<NativeFn<A, R>>())
            .cloned()
    }

    /// Calls the native implementation directly.
    pub fn call<A: 'static, R: 'static>(&self, target: &str, property: &str, args: A) -> Option<R> {
        self.bound::<A, R>(target, property).map(|native| native(args))
    }

    /// Native source text captured for a slot.
    pub fn native_source(&self, target: &str, property: &str) -> Option<&str> {
        self.natives
            .get(&SlotKey::new(target, property))
            .map(|captured| captured.source.as_str())
    }

    /// Whether a source text looks like an untouched built-in.
    pub fn looks_native(source: &str) -> bool {
        source.starts_with("function") && source.contains("[native code]")
    }

    /// Number of captured slots.
    pub fn len(&self) -> usize {
        self.natives.len()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.natives.is_empty()
    }

    /// `setTimeout` counterpart: runs `task` after `delay` on the runtime.
    pub fn set_timeout<F>(&self, delay: Duration, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        })
    }

    /// Sleeps on the captured timer.
    pub async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

impl std::fmt::Debug for NativeVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self.natives.keys().map(|k| k.to_string()).collect();
        keys.sort();
        f.debug_struct("NativeVault").field("natives", &keys).finish()
    }
}
