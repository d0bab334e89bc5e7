#![allow(missing_docs, clippy::unwrap_used, dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use metad::cache::lifecycle::{new_entry, CreateArg, NewEntry};
use metad::cache::{
    CacheClient, CacheEntry, CacheError, CacheKey, CacheTable, EntryPool, EntryType, LruList,
};
use metad::dispatch::{RpcErrorKind, Transport, TransportError};
use metad::fsal::{Fsal, FsalError, NodeType, ObjectAttributes, ObjectHandle, OpContext};

pub fn handle(tag: &str) -> ObjectHandle {
    ObjectHandle::new(Bytes::from(tag.as_bytes().to_vec()))
}

pub fn file_attrs(size: u64) -> ObjectAttributes {
    ObjectAttributes::new(NodeType::RegularFile, size)
}

pub fn dir_attrs() -> ObjectAttributes {
    ObjectAttributes::new(NodeType::Directory, 4096)
}

/// Backing filesystem over an in-memory attribute map.
#[derive(Default)]
pub struct MockFsal {
    attrs: Mutex<HashMap<Vec<u8>, ObjectAttributes>>,
    stale: Mutex<HashSet<Vec<u8>>>,
    cleaned: Mutex<Vec<Vec<u8>>>,
}

impl MockFsal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, handle: &ObjectHandle, attrs: ObjectAttributes) {
        self.attrs.lock().insert(handle.as_bytes().to_vec(), attrs);
    }

    pub fn mark_stale(&self, handle: &ObjectHandle) {
        self.stale.lock().insert(handle.as_bytes().to_vec());
    }

    /// Handles passed to `clean_object_resources`, in call order.
    pub fn cleaned_handles(&self) -> Vec<Vec<u8>> {
        self.cleaned.lock().clone()
    }
}

impl Fsal for MockFsal {
    fn get_attributes(
        &self,
        handle: &ObjectHandle,
        _ctx: &OpContext,
    ) -> Result<ObjectAttributes, FsalError> {
        if self.stale.lock().contains(handle.as_bytes()) {
            return Err(FsalError::Stale);
        }
        self.attrs
            .lock()
            .get(handle.as_bytes())
            .copied()
            .ok_or(FsalError::NotFound)
    }

    fn truncate(
        &self,
        handle: &ObjectHandle,
        _ctx: &OpContext,
        length: u64,
    ) -> Result<ObjectAttributes, FsalError> {
        if self.stale.lock().contains(handle.as_bytes()) {
            return Err(FsalError::Stale);
        }
        let mut attrs = self.attrs.lock();
        let entry = attrs
            .get_mut(handle.as_bytes())
            .ok_or(FsalError::NotFound)?;
        entry.size = length;
        entry.space_used = length;
        entry.mtime = std::time::SystemTime::now();
        entry.ctime = entry.mtime;
        Ok(*entry)
    }

    fn clean_object_resources(&self, handle: &ObjectHandle) -> Result<(), FsalError> {
        self.cleaned.lock().push(handle.as_bytes().to_vec());
        Ok(())
    }
}

/// A complete cache fixture: mock backend, bounded pool, LRU engine, table,
/// and a client wired over all of them.
pub struct Harness {
    pub fsal: Arc<MockFsal>,
    pub pool: Arc<EntryPool>,
    pub lru: Arc<LruList>,
    pub table: Arc<CacheTable>,
    pub client: CacheClient,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_pool(64, 128, 32)
    }

    pub fn with_pool(entries: usize, parent_links: usize, dir_blocks: usize) -> Self {
        let fsal = MockFsal::new();
        let pool = Arc::new(EntryPool::new(entries, parent_links, dir_blocks));
        let lru = LruList::new();
        let table = CacheTable::new();
        let client = CacheClient::new(fsal.clone(), pool.clone(), lru.clone());
        Self {
            fsal,
            pool,
            lru,
            table,
            client,
        }
    }

    pub fn ctx(&self) -> OpContext {
        OpContext::root(1)
    }

    /// Create a regular-file entry for `tag`, seeding the backend first.
    pub fn create_file(&self, tag: &str, size: u64) -> Arc<CacheEntry> {
        let h = handle(tag);
        self.fsal.put(&h, file_attrs(size));
        self.new_file_entry(&h, size).unwrap().into_entry()
    }

    pub fn new_file_entry(&self, h: &ObjectHandle, size: u64) -> Result<NewEntry, CacheError> {
        new_entry(
            &self.client,
            &self.table,
            &CacheKey::start(h.clone()),
            EntryType::RegularFile,
            Some(file_attrs(size)),
            CreateArg::None,
            None,
            &self.ctx(),
            true,
        )
    }

    /// Create a directory-head entry for `tag`.
    pub fn create_dir(&self, tag: &str) -> Arc<CacheEntry> {
        let h = handle(tag);
        self.fsal.put(&h, dir_attrs());
        new_entry(
            &self.client,
            &self.table,
            &CacheKey::start(h.clone()),
            EntryType::DirectoryHead,
            Some(dir_attrs()),
            CreateArg::None,
            None,
            &self.ctx(),
            true,
        )
        .unwrap()
        .into_entry()
    }
}

#[derive(Default)]
struct TransportLog {
    replies: Vec<(u32, Bytes)>,
    errors: Vec<(u32, RpcErrorKind)>,
}

/// Reply channel that records everything sent and wakes waiters.
#[derive(Default)]
pub struct MockTransport {
    log: Mutex<TransportLog>,
    cond: Condvar,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn replies(&self) -> Vec<(u32, Bytes)> {
        self.log.lock().replies.clone()
    }

    pub fn errors(&self) -> Vec<(u32, RpcErrorKind)> {
        self.log.lock().errors.clone()
    }

    /// Wait until `n` replies (errors excluded) have been sent.
    pub fn wait_for_replies(&self, n: usize, timeout: Duration) -> bool {
        let mut log = self.log.lock();
        !self
            .cond
            .wait_while_for(&mut log, |l| l.replies.len() < n, timeout)
            .timed_out()
    }

    /// Wait until `n` sends of any kind have happened.
    pub fn wait_for_sends(&self, n: usize, timeout: Duration) -> bool {
        let mut log = self.log.lock();
        !self
            .cond
            .wait_while_for(&mut log, |l| l.replies.len() + l.errors.len() < n, timeout)
            .timed_out()
    }
}

impl Transport for MockTransport {
    fn send_reply(&self, xid: u32, body: &Bytes) -> Result<(), TransportError> {
        self.log.lock().replies.push((xid, body.clone()));
        self.cond.notify_all();
        Ok(())
    }

    fn send_error(&self, xid: u32, kind: RpcErrorKind) -> Result<(), TransportError> {
        self.log.lock().errors.push((xid, kind));
        self.cond.notify_all();
        Ok(())
    }
}
