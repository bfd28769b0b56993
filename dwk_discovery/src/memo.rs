//! Bounded memoization primitives for the derivation layer.
//!
//! Derived views are pure functions of the store; these caches make repeated
//! queries cheap and, through the pinning helpers, give back the previous
//! result *by identity* whenever the recomputed value is equal, so consumers
//! can diff by `Arc::ptr_eq` instead of deep comparison.

use lru::LruCache;
use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// LRU cache where a max of 0 means unbounded.
pub(crate) struct Lru<K: Hash + Eq, V> {
    inner: LruCache<K, V>,
}

impl<K: Hash + Eq + Clone, V> Lru<K, V> {
    pub fn new(max: usize) -> Self {
        let inner = match NonZeroUsize::new(max) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self { inner }
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    pub fn put(&mut self, key: K, value: V) {
        self.inner.put(key, value);
    }

    /// Hit-or-insert, refreshing recency either way.
    pub fn get_or_insert_with(&mut self, key: K, default: impl FnOnce() -> V) -> &mut V {
        if self.inner.get(&key).is_none() {
            self.inner.put(key.clone(), default());
        }
        self.inner.get_mut(&key).expect("just inserted")
    }

    #[cfg(test)]
    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Two-level bounded cache implementing the per-descriptor cache policy: the
/// outer level is bounded by the number of distinct descriptors, the inner by
/// the number of slots kept beneath a single descriptor. Small-domain
/// parameters (status, booleans) belong in the inner key.
pub(crate) struct OutputCache<K2: Hash + Eq, V> {
    outer: Lru<Arc<str>, Lru<K2, V>>,
    outputs_per_descriptor: usize,
}

impl<K2: Hash + Eq + Clone, V: Default> OutputCache<K2, V> {
    pub fn new(descriptors: usize, outputs_per_descriptor: usize) -> Self {
        Self {
            outer: Lru::new(descriptors),
            outputs_per_descriptor,
        }
    }

    /// The slot for `(descriptor, key)`, created on first access.
    pub fn entry(&mut self, descriptor: &Arc<str>, key: K2) -> &mut V {
        let outputs_per_descriptor = self.outputs_per_descriptor;
        let inner = self
            .outer
            .get_or_insert_with(descriptor.clone(), || Lru::new(outputs_per_descriptor));
        inner.get_or_insert_with(key, V::default)
    }
}

/// Keep the previously returned vector when the recomputation is element-wise
/// equal, so the caller observes a stable identity.
pub(crate) fn pin_vec<T: PartialEq>(slot: &mut Option<Arc<Vec<T>>>, new: Vec<T>) -> Arc<Vec<T>> {
    match slot {
        Some(previous) if **previous == new => previous.clone(),
        _ => {
            let arc = Arc::new(new);
            *slot = Some(arc.clone());
            arc
        }
    }
}

/// Same as [`pin_vec`] for map results: own-keys and per-key equality.
pub(crate) fn pin_map<K: Hash + Eq, V: PartialEq>(
    slot: &mut Option<Arc<HashMap<K, V>>>,
    new: HashMap<K, V>,
) -> Arc<HashMap<K, V>> {
    match slot {
        Some(previous) if **previous == new => previous.clone(),
        _ => {
            let arc = Arc::new(new);
            *slot = Some(arc.clone());
            arc
        }
    }
}

/// Pointer-wise equality of two Arc slices, the cheap path used to detect
/// that the inputs of a memoized derivation are unchanged.
pub(crate) fn same_arcs<T>(a: &[Arc<T>], b: &[Arc<T>]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| Arc::ptr_eq(x, y))
}
