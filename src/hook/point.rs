//! Generic hook primitive.
//!
//! A [`HookPoint`] is one hookable function slot (for example
//! `EventTarget.prototype.addEventListener`). Instead of nesting proxies, every
//! slot keeps an explicit ordered interceptor chain: the most recently installed
//! interceptor runs first and reaches the next one through [`Next::call`], the
//! innermost link being the native implementation. Any interceptor can be removed
//! through its [`Unhook`] handle without disturbing the others.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tronclass_enhancer::hook::HookPoint;
//!
//! let point = Arc::new(HookPoint::native("double", |x: i32| x * 2));
//! let unhook = point.install(|x: i32, next| next.call(x + 1));
//!
//! assert_eq!(point.call(1), 4);
//! assert_eq!(point.to_source(), "function double() { [native code] }");
//!
//! unhook.unhook();
//! assert_eq!(point.call(1), 2);
//! ```

use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Hook ID counter, shared by every hook point in the process.
static NEXT_HOOK_ID: AtomicU64 = AtomicU64::new(1);

/// Native implementation of a hookable function.
pub type NativeFn<A, R> = Arc<dyn Fn(A) -> R + Send + Sync>;

/// Interceptor installed on a hook point.
///
/// Receives the call arguments and the rest of the chain.
pub type InterceptorFn<A, R> = Arc<dyn Fn(A, Next<A, R>) -> R + Send + Sync>;

/// Identifier of one installed interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

impl HookId {
    fn next() -> Self {
        Self(NEXT_HOOK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook#{}", self.0)
    }
}

struct HookEntry<A, R> {
    id: HookId,
    interceptor: InterceptorFn<A, R>,
}

impl<A, R> Clone for HookEntry<A, R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            interceptor: self.interceptor.clone(),
        }
    }
}

/// The remainder of an interceptor chain.
///
/// Owned, so it can be moved into a future when the hooked function is
/// asynchronous.
pub struct Next<A, R> {
    chain: Arc<[HookEntry<A, R>]>,
    remaining: usize,
    native: NativeFn<A, R>,
}

impl<A, R> Next<A, R> {
    /// Calls the next interceptor, or the native implementation when the
    /// chain is exhausted.
    pub fn call(self, args: A) -> R {
        if self.remaining == 0 {
            return (self.native)(args);
        }

        let index = self.remaining - 1;
        let interceptor = self.chain[index].interceptor.clone();
        interceptor(
            args,
            Next {
                chain: self.chain,
                remaining: index,
                native: self.native,
            },
        )
    }

    /// Number of interceptors still ahead of the native implementation.
    pub fn depth(&self) -> usize {
        self.remaining
    }
}

/// A hookable function slot with an ordered interceptor chain.
pub struct HookPoint<A, R> {
    name: String,
    source: String,
    native: NativeFn<A, R>,
    constructor: Option<NativeFn<A, R>>,
    chain: RwLock<Arc<[HookEntry<A, R>]>>,
}

impl<A: 'static, R: 'static> HookPoint<A, R> {
    /// Creates a hook point around a native implementation.
    ///
    /// The reported source text mimics a built-in function.
    pub fn native<F>(name: impl Into<String>, native: F) -> Self
    where
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            source: format!("function {}() {{ [native code] }}", name),
            name,
            native: Arc::new(native),
            constructor: None,
            chain: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Makes the slot constructible.
    ///
    /// Construction always reaches this implementation directly; interceptors
    /// only affect call semantics.
    pub fn with_constructor<F>(mut self, constructor: F) -> Self
    where
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        self.constructor = Some(Arc::new(constructor));
        self
    }

    /// Function name of the slot.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Native-looking source text, unaffected by installed interceptors.
    pub fn to_source(&self) -> &str {
        &self.source
    }

    /// Calls the slot through every installed interceptor.
    pub fn call(&self, args: A) -> R {
        // Snapshot so interceptors may hook or unhook re-entrantly.
        let chain = self.chain.read().clone();
        Next {
            remaining: chain.len(),
            chain,
            native: self.native.clone(),
        }
        .call(args)
    }

    /// Constructs through the slot. Returns `None` if the slot is not
    /// constructible.
    pub fn construct(&self, args: A) -> Option<R> {
        self.constructor.as_ref().map(|ctor| ctor(args))
    }

    /// The untouched native implementation.
    pub fn native_fn(&self) -> NativeFn<A, R> {
        self.native.clone()
    }

    /// Number of interceptors currently installed.
    pub fn interceptor_count(&self) -> usize {
        self.chain.read().len()
    }

    /// Installs an interceptor as the new outermost link of the chain.
    pub fn install<F>(self: &Arc<Self>, interceptor: F) -> Unhook
    where
        F: Fn(A, Next<A, R>) -> R + Send + Sync + 'static,
    {
        let id = HookId::next();
        {
            let mut chain = self.chain.write();
            let mut entries: Vec<HookEntry<A, R>> = chain.iter().cloned().collect();
            entries.push(HookEntry {
                id,
                interceptor: Arc::new(interceptor),
            });
            *chain = Arc::from(entries);
        }
        trace!("Installed {} on {}", id, self.name);

        let weak: Weak<Self> = Arc::downgrade(self);
        let point: Weak<dyn Detach> = weak;
        Unhook {
            id,
            label: self.name.clone(),
            point,
        }
    }

    fn remove(&self, id: HookId) -> bool {
        let mut chain = self.chain.write();
        if !chain.iter().any(|entry| entry.id == id) {
            return false;
        }
        let entries: Vec<HookEntry<A, R>> =
            chain.iter().filter(|entry| entry.id != id).cloned().collect();
        *chain = Arc::from(entries);
        true
    }
}

impl<A, R> fmt::Debug for HookPoint<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookPoint")
            .field("name", &self.name)
            .field("interceptors", &self.chain.read().len())
            .field("constructible", &self.constructor.is_some())
            .finish()
    }
}

/// Type-erased view of a hook point, used by the realm and the native vault.
pub trait ErasedHookPoint: Send + Sync {
    /// Function name.
    fn name(&self) -> &str;
    /// Native-looking source text.
    fn source(&self) -> &str;
    /// Number of installed interceptors.
    fn interceptor_count(&self) -> usize;
    /// The native implementation, boxed as `NativeFn<A, R>`.
    fn native_any(&self) -> Arc<dyn Any + Send + Sync>;
    /// Upcast for downcasting to the concrete `HookPoint<A, R>`.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<A: 'static, R: 'static> ErasedHookPoint for HookPoint<A, R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn interceptor_count(&self) -> usize {
        HookPoint::interceptor_count(self)
    }

    fn native_any(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::new(self.native.clone())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: HookId) -> bool;
}

impl<A: 'static, R: 'static> Detach for HookPoint<A, R> {
    fn detach(&self, id: HookId) -> bool {
        self.remove(id)
    }
}

/// Handle that removes one interceptor from its hook point.
#[must_use = "dropping an Unhook leaves the interceptor installed"]
pub struct Unhook {
    id: HookId,
    label: String,
    point: Weak<dyn Detach>,
}

impl Unhook {
    /// Identifier of the interceptor.
    pub fn id(&self) -> HookId {
        self.id
    }

    /// Name of the hooked function.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Removes the interceptor. Returns `false` if it was already gone.
    pub fn unhook(self) -> bool {
        let removed = self
            .point
            .upgrade()
            .map(|point| point.detach(self.id))
            .unwrap_or(false);
        trace!("Unhooked {} from {} (removed: {})", self.id, self.label, removed);
        removed
    }
}

impl fmt::Debug for Unhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unhook")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}
