//! Property slots of the page's global objects.
//!
//! The realm maps `(target, property)` pairs such as
//! `("EventTarget.prototype", "addEventListener")` to what currently lives in
//! that property: a hookable method, an accessor, or plain data. It is the
//! lookup layer behind [`Realm::hook`], which refuses anything that is not a
//! function of the requested signature.

use crate::hook::point::{ErasedHookPoint, HookPoint, Next, Unhook};
use crate::hook::HookInstallError;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Address of a property slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    /// Owning object, e.g. `window` or `XMLHttpRequest.prototype`.
    pub target: String,
    /// Property name.
    pub property: String,
}

impl SlotKey {
    /// Creates a slot key.
    pub fn new(target: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            property: property.into(),
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.property)
    }
}

/// What a property slot holds.
#[derive(Clone)]
pub enum Slot {
    /// A callable method.
    Method(Arc<dyn ErasedHookPoint>),
    /// A getter-backed accessor property.
    Accessor(Arc<dyn ErasedHookPoint>),
    /// A plain data property.
    Data(Value),
}

impl Slot {
    fn kind(&self) -> &'static str {
        match self {
            Slot::Method(_) => "method",
            Slot::Accessor(_) => "accessor",
            Slot::Data(_) => "data property",
        }
    }
}

/// Registry of the page's property slots.
#[derive(Default)]
pub struct Realm {
    slots: RwLock<HashMap<SlotKey, Slot>>,
}

impl Realm {
    /// Creates an empty realm.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a method slot.
    pub fn define_method<A: 'static, R: 'static>(
        &self,
        target: &str,
        property: &str,
        point: Arc<HookPoint<A, R>>,
    ) {
        self.slots
            .write()
            .insert(SlotKey::new(target, property), Slot::Method(point));
    }

    /// Defines an accessor slot backed by a getter hook point.
    pub fn define_accessor<T: 'static>(
        &self,
        target: &str,
        property: &str,
        getter: Arc<HookPoint<(), T>>,
    ) {
        self.slots
            .write()
            .insert(SlotKey::new(target, property), Slot::Accessor(getter));
    }

    /// Defines a plain data slot.
    pub fn define_data(&self, target: &str, property: &str, value: Value) {
        self.slots
            .write()
            .insert(SlotKey::new(target, property), Slot::Data(value));
    }

    /// Returns the slot at the given address.
    pub fn slot(&self, target: &str, property: &str) -> Option<Slot> {
        self.slots
            .read()
            .get(&SlotKey::new(target, property))
            .cloned()
    }

    /// All slot keys, sorted.
    pub fn keys(&self) -> Vec<SlotKey> {
        let mut keys: Vec<SlotKey> = self.slots.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Looks up a method slot with the given signature.
    pub fn method<A: 'static, R: 'static>(
        &self,
        target: &str,
        property: &str,
    ) -> Result<Arc<HookPoint<A, R>>, HookInstallError> {
        match self.slot(target, property) {
            Some(Slot::Method(point)) => downcast_point(point, target, property),
            Some(other) => Err(HookInstallError::invalid(
                target,
                property,
                format!("found a {}", other.kind()),
            )),
            None => Err(HookInstallError::invalid(target, property, "property is undefined")),
        }
    }

    /// Hooks a method slot.
    ///
    /// Fails with [`HookInstallError::InvalidHookTarget`] unless the property
    /// currently holds a function of signature `A -> R`.
    pub fn hook<A, R, F>(
        &self,
        target: &str,
        property: &str,
        interceptor: F,
    ) -> Result<Unhook, HookInstallError>
    where
        A: 'static,
        R: 'static,
        F: Fn(A, Next<A, R>) -> R + Send + Sync + 'static,
    {
        let point = self.method::<A, R>(target, property)?;
        let unhook = point.install(interceptor);
        debug!("Hooked {}.{} ({})", target, property, unhook.id());
        Ok(unhook)
    }

    /// Overrides the getter of an accessor slot, the `Object.defineProperty`
    /// counterpart of [`Realm::hook`].
    pub fn override_getter<T, F>(
        &self,
        target: &str,
        property: &str,
        getter: F,
    ) -> Result<Unhook, HookInstallError>
    where
        T: 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let point = match self.slot(target, property) {
            Some(Slot::Accessor(point)) => downcast_point::<(), T>(point, target, property)?,
            Some(other) => {
                return Err(HookInstallError::invalid(
                    target,
                    property,
                    format!("found a {}, expected an accessor", other.kind()),
                ))
            }
            None => {
                return Err(HookInstallError::invalid(
                    target,
                    property,
                    "property is undefined",
                ))
            }
        };
        let unhook = point.install(move |_: (), _next: Next<(), T>| getter());
        debug!("Redefined getter {}.{} ({})", target, property, unhook.id());
        Ok(unhook)
    }

    /// `Function.prototype.toString` of whatever lives in the slot.
    pub fn source_of(&self, target: &str, property: &str) -> Option<String> {
        match self.slot(target, property)? {
            Slot::Method(point) | Slot::Accessor(point) => Some(point.source().to_string()),
            Slot::Data(_) => None,
        }
    }

    /// Number of interceptors installed on a method or accessor slot.
    pub fn interceptor_count(&self, target: &str, property: &str) -> usize {
        match self.slot(target, property) {
            Some(Slot::Method(point)) | Some(Slot::Accessor(point)) => point.interceptor_count(),
            _ => 0,
        }
    }

    pub(crate) fn erased_points(&self) -> Vec<(SlotKey, Arc<dyn ErasedHookPoint>)> {
        self.slots
            .read()
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Method(point) => Some((key.clone(), point.clone())),
                _ => None,
            })
            .collect()
    }
}

fn downcast_point<A: 'static, R: 'static>(
    point: Arc<dyn ErasedHookPoint>,
    target: &str,
    property: &str,
) -> Result<Arc<HookPoint<A, R>>, HookInstallError> {
    point.into_any().downcast::<HookPoint<A, R>>().map_err(|_| {
        HookInstallError::invalid(target, property, "function has a different signature")
    })
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm").field("slots", &self.keys()).finish()
    }
}
