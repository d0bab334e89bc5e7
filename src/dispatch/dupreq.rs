//! Per-worker duplicate-request cache.
//!
//! Retransmitted requests whose reply was already sent get the stored bytes
//! replayed verbatim instead of re-running the handler. The cache is owned
//! by one worker and needs no locking; a periodic sweep evicts replies by
//! age regardless of how recently they were replayed.

use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DupReqError {
    #[error("a reply for xid {0} is already stored")]
    AlreadyStored(u32),
}

#[derive(Debug)]
struct StoredReply {
    body: Bytes,
    stored_at: Instant,
}

#[derive(Debug, Default)]
pub struct DupReqCache {
    replies: FxHashMap<u32, StoredReply>,
}

impl DupReqCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored reply for a transaction id, if one survives.
    pub fn get(&self, xid: u32) -> Option<&Bytes> {
        self.replies.get(&xid).map(|stored| &stored.body)
    }

    /// Store the encoded reply just sent for `xid`.
    pub fn insert(&mut self, xid: u32, body: Bytes) -> Result<(), DupReqError> {
        if self.replies.contains_key(&xid) {
            return Err(DupReqError::AlreadyStored(xid));
        }
        self.replies.insert(
            xid,
            StoredReply {
                body,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Evict replies older than `retention`, returning how many went.
    pub fn sweep(&mut self, retention: Duration) -> usize {
        let before = self.replies.len();
        self.replies
            .retain(|_, stored| stored.stored_at.elapsed() <= retention);
        before - self.replies.len()
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }
}
