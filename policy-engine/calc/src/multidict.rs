//! A map from keys to sets of values, used for the symmetric match state of
//! the indexes and the sequencer's per-IP-set pending membership.
//!
//! Backed by ordered collections so that iteration order is deterministic.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug)]
pub struct MultiMap<K: Ord, V: Ord> {
    inner: BTreeMap<K, BTreeSet<V>>,
}

impl<K: Ord, V: Ord> Default for MultiMap<K, V> {
    fn default() -> Self {
        Self {
            inner: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: Ord> MultiMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value under a key; returns false if it was already present.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        self.inner.entry(key).or_default().insert(value)
    }

    /// Removes a value; drops the key once its set is empty. Returns false
    /// if the value was not present.
    pub fn remove(&mut self, key: &K, value: &V) -> bool {
        match self.inner.get_mut(key) {
            None => false,
            Some(values) => {
                let removed = values.remove(value);
                if values.is_empty() {
                    self.inner.remove(key);
                }
                removed
            }
        }
    }

    pub fn contains(&self, key: &K, value: &V) -> bool {
        self.inner.get(key).is_some_and(|vs| vs.contains(value))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Removes and returns every value under a key.
    pub fn discard_key(&mut self, key: &K) -> BTreeSet<V> {
        self.inner.remove(key).unwrap_or_default()
    }

    pub fn get(&self, key: &K) -> impl Iterator<Item = &V> {
        self.inner.get(key).into_iter().flatten()
    }

    pub fn num_values(&self, key: &K) -> usize {
        self.inner.get(key).map(BTreeSet::len).unwrap_or(0)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
