//! LRU/GC engine.
//!
//! The engine owns reclamation policy; the cache only registers entries,
//! invalidates registrations, and supplies the reclamation callback. Tokens
//! are generation counters, so a stale token from a previous registration is
//! rejected instead of invalidating someone else's slot.

use std::sync::{Arc, Weak};

use hashlink::LinkedHashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use super::entry::CacheEntry;

pub type LruToken = u64;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LruError {
    #[error("unknown or stale lru token {0}")]
    UnknownToken(LruToken),
}

#[derive(Debug)]
struct LruSlot {
    valid: bool,
    entry: Weak<CacheEntry>,
}

#[derive(Debug)]
struct LruInner {
    next_token: LruToken,
    slots: LinkedHashMap<LruToken, LruSlot>,
    nb_invalid: usize,
}

/// Ordered set of live cache entries, least recently registered first.
#[derive(Debug)]
pub struct LruList {
    inner: Mutex<LruInner>,
}

impl Default for LruList {
    fn default() -> Self {
        Self {
            inner: Mutex::new(LruInner {
                next_token: 1,
                slots: LinkedHashMap::new(),
                nb_invalid: 0,
            }),
        }
    }
}

impl LruList {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an entry at the most-recently-used end and return the token
    /// for this registration.
    pub fn register(&self, entry: &Arc<CacheEntry>) -> LruToken {
        let mut inner = self.inner.lock();
        let token = inner.next_token;
        inner.next_token += 1;
        inner.slots.insert(
            token,
            LruSlot {
                valid: true,
                entry: Arc::downgrade(entry),
            },
        );
        token
    }

    /// Mark a registration invalid. The slot stays in place until the next
    /// [`gc_invalid`](Self::gc_invalid) pass.
    pub fn invalidate(&self, token: LruToken) -> Result<(), LruError> {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(&token) {
            Some(slot) => {
                if slot.valid {
                    slot.valid = false;
                    inner.nb_invalid += 1;
                }
                Ok(())
            }
            None => Err(LruError::UnknownToken(token)),
        }
    }

    /// Invalidate every valid slot whose entry satisfies `pred`, returning
    /// how many were invalidated.
    ///
    /// The predicate runs without the list lock held so it may lock entries.
    /// Best-effort: registrations added or invalidated concurrently are not
    /// revisited.
    pub fn invalidate_matching(&self, mut pred: impl FnMut(&Arc<CacheEntry>) -> bool) -> usize {
        let snapshot: Vec<(LruToken, Weak<CacheEntry>)> = {
            let inner = self.inner.lock();
            inner
                .slots
                .iter()
                .filter(|(_, slot)| slot.valid)
                .map(|(token, slot)| (*token, slot.entry.clone()))
                .collect()
        };

        let mut matched = Vec::new();
        for (token, weak) in snapshot {
            if let Some(entry) = weak.upgrade() {
                if pred(&entry) {
                    matched.push(token);
                }
            } else {
                // Entry already dropped; fold its slot into this pass.
                matched.push(token);
            }
        }

        let mut inner = self.inner.lock();
        let mut count = 0;
        for token in matched {
            if let Some(slot) = inner.slots.get_mut(&token) {
                if slot.valid {
                    slot.valid = false;
                    inner.nb_invalid += 1;
                    count += 1;
                }
            }
        }
        count
    }

    /// Remove invalid slots and slots whose entry is gone, handing each
    /// still-upgradable reclaimed entry to `reclaim`.
    ///
    /// The callback runs without the list lock held, so it may kill entries.
    pub fn gc_invalid(&self, mut reclaim: impl FnMut(Arc<CacheEntry>)) {
        let reclaimed: Vec<Arc<CacheEntry>> = {
            let mut inner = self.inner.lock();
            let doomed: Vec<LruToken> = inner
                .slots
                .iter()
                .filter(|(_, slot)| !slot.valid || slot.entry.strong_count() == 0)
                .map(|(token, _)| *token)
                .collect();

            let mut out = Vec::new();
            for token in doomed {
                if let Some(slot) = inner.slots.remove(&token) {
                    if !slot.valid {
                        inner.nb_invalid -= 1;
                        if let Some(entry) = slot.entry.upgrade() {
                            out.push(entry);
                        }
                    }
                }
            }
            out
        };

        if !reclaimed.is_empty() {
            trace!(count = reclaimed.len(), "reclaiming invalidated lru slots");
        }
        for entry in reclaimed {
            reclaim(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn invalid_count(&self) -> usize {
        self.inner.lock().nb_invalid
    }
}
