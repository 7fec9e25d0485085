//! Values shared across requests.
//!
//! Two type-keyed stores live here. [`AppState`] holds arbitrary application data
//! (database pools, configuration, counters) that handlers pull in with the
//! [`State`](crate::extractor::State) extractor. [`ControllerCache`] holds exactly one
//! instance per [`Controller`] type, created the first time a handler asks for it
//! and reused for every later request.
//!
//! Controllers never carry per-request data: the request and response reach a
//! handler only through its own arguments, so concurrent requests served by the
//! same controller instance cannot observe each other.
//!
//! # Examples
//!
//! ```
//! use routeforge_core::prelude::*;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! #[derive(Default)]
//! struct Counter {
//!     hits: AtomicU64,
//! }
//!
//! impl Controller for Counter {}
//!
//! async fn hit(counter: Arc<Counter>) -> String {
//!     let n = counter.hits.fetch_add(1, Ordering::Relaxed) + 1;
//!     format!("hit #{}", n)
//! }
//!
//! let router = Router::new().get("/hit", handler(hit));
//! ```

use std::any::{Any, TypeId, type_name};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::{Error, Result};

type Erased = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Default)]
struct TypeMap {
    entries: Arc<DashMap<TypeId, Erased>>,
}

impl TypeMap {
    fn insert<T: Send + Sync + 'static>(&self, value: Arc<T>) {
        self.entries.insert(TypeId::of::<T>(), value);
    }

    fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    fn get_or_insert_with<T, F>(&self, create: F) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Arc<T>,
    {
        let entry = self
            .entries
            .entry(TypeId::of::<T>())
            .or_insert_with(|| create() as Erased)
            .value()
            .clone();
        entry.downcast::<T>().ok()
    }

    fn remove<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .remove(&TypeId::of::<T>())
            .and_then(|(_, value)| value.downcast::<T>().ok())
    }

    fn contains<T: 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }
}

/// Application data shared by every handler of a router.
#[derive(Clone, Default)]
pub struct AppState {
    map: TypeMap,
}

impl AppState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, replacing any previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&self, value: Arc<T>) {
        self.map.insert(value);
    }

    /// Fetches a value by type.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.map.get()
    }

    /// Whether a value of type `T` is stored.
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.map.contains::<T>()
    }

    /// Removes and returns a value by type.
    pub fn remove<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.map.remove()
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.map.entries.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.map.entries.is_empty()
    }
}

/// A type whose handlers share one lazily created instance.
///
/// Handlers receive the instance as an `Arc<C>` argument.
pub trait Controller: Default + Send + Sync + 'static {}

/// One instance per controller type.
#[derive(Clone, Default)]
pub struct ControllerCache {
    map: TypeMap,
}

impl ControllerCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pre-built instance, replacing any cached one.
    pub fn insert<C: Controller>(&self, instance: Arc<C>) {
        self.map.insert(instance);
    }

    /// Returns the cached instance, creating it with `C::default()` on first use.
    pub fn get_or_create<C: Controller>(&self) -> Result<Arc<C>> {
        self.map
            .get_or_insert_with(|| {
                debug!("Creating controller instance {}", type_name::<C>());
                Arc::new(C::default())
            })
            .ok_or_else(|| Error::extractor(format!("controller cache entry for {} has the wrong type", type_name::<C>())))
    }

    /// Whether an instance of `C` exists.
    pub fn contains<C: Controller>(&self) -> bool {
        self.map.contains::<C>()
    }

    /// Number of cached instances.
    pub fn len(&self) -> usize {
        self.map.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.map.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CREATED: AtomicUsize = AtomicUsize::new(0);

    struct Tracked;

    impl Default for Tracked {
        fn default() -> Self {
            CREATED.fetch_add(1, Ordering::SeqCst);
            Tracked
        }
    }

    impl Controller for Tracked {}

    #[derive(Default)]
    struct Named {
        name: String,
    }

    impl Controller for Named {}

    #[test]
    fn test_state_insert_and_get() {
        let state = AppState::new();
        state.insert(Arc::new(String::from("test")));
        state.insert(Arc::new(42_u32));
        assert_eq!(*state.get::<String>().unwrap(), "test");
        assert_eq!(*state.get::<u32>().unwrap(), 42);
        assert!(state.get::<i64>().is_none());
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_state_replace_and_remove() {
        let state = AppState::new();
        state.insert(Arc::new(10_u32));
        state.insert(Arc::new(20_u32));
        assert_eq!(*state.get::<u32>().unwrap(), 20);
        assert_eq!(*state.remove::<u32>().unwrap(), 20);
        assert!(!state.contains::<u32>());
        assert!(state.is_empty());
    }

    #[test]
    fn test_state_clones_share_storage() {
        let state = AppState::new();
        let other = state.clone();
        other.insert(Arc::new(true));
        assert!(state.contains::<bool>());
    }

    #[test]
    fn test_controller_created_once() {
        let cache = ControllerCache::new();
        let first = cache.get_or_create::<Tracked>().unwrap();
        let second = cache.get_or_create::<Tracked>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(CREATED.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_registered_controller_is_used() {
        let cache = ControllerCache::new();
        cache.insert(Arc::new(Named {
            name: "preset".to_string(),
        }));
        assert_eq!(cache.get_or_create::<Named>().unwrap().name, "preset");
    }
}
