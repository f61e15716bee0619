//! Keyed object cache with inverted secondary indexes.
//!
//! Single writer (the owning reflector task), many readers (worker, HTTP
//! handlers). The lock is released before any external call; returned objects
//! are cheap `Arc` clones of immutable trees.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use manta_core::Object;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Computes the index values an object belongs under. Evaluation problems are
/// the indexer's business; returning no keys leaves the object unindexed.
pub type IndexFn = Arc<dyn Fn(&Object) -> Vec<String> + Send + Sync>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("index {0} not exists")]
    UnknownIndex(String),
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<String, Object>,
    /// Insertion order of live keys; list endpoints promise a stable order.
    order: Vec<String>,
    /// index name -> index value -> keys, each bucket in insertion order.
    inverted: FxHashMap<String, FxHashMap<String, Vec<String>>>,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
    indexers: Arc<HashMap<String, IndexFn>>,
}

impl Store {
    pub fn new(indexers: HashMap<String, IndexFn>) -> Self {
        let mut inner = Inner::default();
        for name in indexers.keys() {
            inner.inverted.insert(name.clone(), FxHashMap::default());
        }
        Self { inner: Arc::new(RwLock::new(inner)), indexers: Arc::new(indexers) }
    }

    /// Insert or replace; returns the previous object when the key was live.
    pub fn upsert(&self, key: &str, obj: Object) -> Option<Object> {
        let mut inner = self.inner.write().unwrap();
        let prev = inner.objects.insert(key.to_string(), obj.clone());
        if prev.is_none() {
            inner.order.push(key.to_string());
        }
        for (name, index_fn) in self.indexers.iter() {
            let old_values = prev.as_ref().map(|o| index_fn(o)).unwrap_or_default();
            let new_values = index_fn(&obj);
            let buckets = inner.inverted.get_mut(name).unwrap();
            for value in &old_values {
                if !new_values.contains(value) {
                    if let Some(bucket) = buckets.get_mut(value) {
                        bucket.retain(|k| k != key);
                        if bucket.is_empty() {
                            buckets.remove(value);
                        }
                    }
                }
            }
            for value in new_values {
                let bucket = buckets.entry(value).or_default();
                if !bucket.iter().any(|k| k == key) {
                    bucket.push(key.to_string());
                }
            }
        }
        prev
    }

    /// Remove a key; returns the object that was stored, if any.
    pub fn remove(&self, key: &str) -> Option<Object> {
        let mut inner = self.inner.write().unwrap();
        let prev = inner.objects.remove(key)?;
        inner.order.retain(|k| k != key);
        for (name, index_fn) in self.indexers.iter() {
            let buckets = inner.inverted.get_mut(name).unwrap();
            for value in index_fn(&prev) {
                if let Some(bucket) = buckets.get_mut(&value) {
                    bucket.retain(|k| k != key);
                    if bucket.is_empty() {
                        buckets.remove(&value);
                    }
                }
            }
        }
        Some(prev)
    }

    pub fn get(&self, key: &str) -> Option<Object> {
        self.inner.read().unwrap().objects.get(key).cloned()
    }

    pub fn list(&self) -> Vec<Object> {
        let inner = self.inner.read().unwrap();
        inner.order.iter().filter_map(|k| inner.objects.get(k).cloned()).collect()
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.inner.read().unwrap().order.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Objects whose index `name` contains `value`, in store insertion order.
    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<Object>, StoreError> {
        let inner = self.inner.read().unwrap();
        let buckets = inner
            .inverted
            .get(name)
            .ok_or_else(|| StoreError::UnknownIndex(name.to_string()))?;
        Ok(buckets
            .get(value)
            .map(|bucket| bucket.iter().filter_map(|k| inner.objects.get(k).cloned()).collect())
            .unwrap_or_default())
    }

    /// Distinct values currently present in index `name`, sorted.
    pub fn index_values(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().unwrap();
        let buckets = inner
            .inverted
            .get(name)
            .ok_or_else(|| StoreError::UnknownIndex(name.to_string()))?;
        let mut values: Vec<String> = buckets.keys().cloned().collect();
        values.sort();
        Ok(values)
    }

    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexers.keys().cloned().collect();
        names.sort();
        names
    }
}
