//! Full-cache garbage collection.
//!
//! A sweep invalidates the LRU registrations of entries unused longer than
//! the configured age, drops their slots from the engine, and reclaims the
//! entries through forced removal. Continuation segments are never selected
//! directly; they go down with their head.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::debug;

use super::entry::{CacheEntry, EntryType, Validity};
use super::lifecycle;
use super::table::CacheTable;
use super::CacheClient;

#[derive(Debug, Clone, Copy, Default)]
pub struct GcOutcome {
    pub invalidated: usize,
    pub reclaimed: usize,
}

/// Run one full-cache sweep.
pub fn run_gc(client: &CacheClient, table: &CacheTable, unused_age: Duration) -> GcOutcome {
    let now = SystemTime::now();
    let mut doomed: Vec<Arc<CacheEntry>> = Vec::new();

    let invalidated = client.lru.invalidate_matching(|entry| {
        let mut state = entry.lock();
        if state.validity != Validity::Valid {
            return false;
        }
        if state.entry_type() == EntryType::DirectoryContinuation {
            return false;
        }
        let unused = now.duration_since(state.last_used()).unwrap_or_default();
        if unused <= unused_age {
            return false;
        }
        state.validity = Validity::Invalid;
        // This pass owns the registration now; the slot dies with it.
        state.gc = None;
        doomed.push(entry.clone());
        true
    });

    client.lru.gc_invalid(|_| {});

    let mut reclaimed = 0;
    for entry in doomed {
        match lifecycle::kill(client, table, &entry) {
            Ok(()) => reclaimed += 1,
            Err(err) => debug!(%err, "gc reclamation skipped an entry"),
        }
    }

    if invalidated > 0 || reclaimed > 0 {
        debug!(invalidated, reclaimed, "gc sweep finished");
    }
    GcOutcome {
        invalidated,
        reclaimed,
    }
}
