//! Cache hash table.
//!
//! The table holds the only strong references to cache entries. Everything
//! else in the cache reaches entries through `Weak` links, so removal from
//! the table is what ultimately lets an entry die.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::entry::CacheEntry;
use super::key::CacheKey;
use super::CacheError;

#[derive(Debug, Default)]
pub struct CacheTable {
    map: RwLock<FxHashMap<CacheKey, Arc<CacheEntry>>>,
}

/// Outcome of an atomic insert-if-absent.
pub enum Insert {
    Inserted,
    /// Another thread won the race; here is its entry.
    AlreadyPresent(Arc<CacheEntry>),
}

impl CacheTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.map.read().get(key).cloned()
    }

    /// Insert `entry` under `key` unless the key is already bound. Check and
    /// insert happen under one write lock, so two racing creators cannot
    /// both insert.
    pub fn insert_if_absent(&self, key: CacheKey, entry: Arc<CacheEntry>) -> Insert {
        let mut map = self.map.write();
        match map.get(&key) {
            Some(existing) => Insert::AlreadyPresent(existing.clone()),
            None => {
                map.insert(key, entry);
                Insert::Inserted
            }
        }
    }

    /// Unbind `key`, returning the entry that was bound to it.
    pub fn remove(&self, key: &CacheKey) -> Result<Arc<CacheEntry>, CacheError> {
        self.map.write().remove(key).ok_or(CacheError::NotFound)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.map.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
