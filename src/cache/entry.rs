//! Cache entry data model.
//!
//! Entries are shared as `Arc<CacheEntry>`; the cache table holds the only
//! strong references, and every inter-entry link (parent back-links,
//! directory chain links, directory slot children) is a `Weak`. A dangling
//! `Weak` is therefore always a stale link, never a leak.
//!
//! Lock order: an entry's own lock first, then the lock of a directory head
//! reached through a continuation's back-link. That child-before-parent order
//! is the single global order; no path locks a continuation while holding its
//! head.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};

use super::lru::{LruList, LruToken};
use super::CacheError;
use crate::fsal::{Cookie, NodeType, ObjectAttributes, ObjectHandle, DIR_START};

/// Number of name slots per directory segment.
pub const DIR_SLOT_COUNT: usize = 32;

/// One name slot inside a directory segment.
#[derive(Debug, Default)]
pub struct DirSlot {
    pub active: bool,
    pub name: String,
    pub child: Option<Weak<CacheEntry>>,
}

/// Fixed-capacity slot array backing a directory segment. Allocated from and
/// recycled through the entry pool.
#[derive(Debug)]
pub struct DirData {
    pub slots: [DirSlot; DIR_SLOT_COUNT],
}

impl Default for DirData {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| DirSlot::default()),
        }
    }
}

impl DirData {
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.active = false;
            slot.name.clear();
            slot.child = None;
        }
    }

    pub fn first_free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| !slot.active)
    }

    pub fn find_active(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.active && slot.name == name)
    }
}

/// Open file-descriptor retention state for a regular file.
#[derive(Debug, Default)]
pub struct FdState {
    pub descriptor: Option<i32>,
    pub open_flags: u32,
    pub last_op: Option<Instant>,
}

impl FdState {
    pub fn is_open(&self) -> bool {
        self.descriptor.is_some()
    }

    pub fn idle_longer_than(&self, retention: Duration) -> bool {
        match self.last_op {
            Some(at) => at.elapsed() > retention,
            None => false,
        }
    }

    pub fn close(&mut self) {
        self.descriptor = None;
        self.open_flags = 0;
        self.last_op = None;
    }
}

#[derive(Debug)]
pub struct FileData {
    pub handle: ObjectHandle,
    pub attributes: ObjectAttributes,
    /// Token into the secondary content cache, when attached.
    pub content: Option<crate::fsal::ContentHandle>,
    pub fd: FdState,
}

#[derive(Debug)]
pub struct SymlinkData {
    pub handle: ObjectHandle,
    pub attributes: ObjectAttributes,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    Socket,
    Fifo,
    BlockDevice,
    CharDevice,
}

#[derive(Debug)]
pub struct SpecialData {
    pub handle: ObjectHandle,
    pub attributes: ObjectAttributes,
    pub kind: SpecialKind,
}

/// Head segment of a cached directory.
#[derive(Debug)]
pub struct DirHeadData {
    pub handle: ObjectHandle,
    pub attributes: ObjectAttributes,
    /// Whether the full directory listing has been materialized from the
    /// backend. Cleared whenever a dirent is invalidated.
    pub has_been_readdir: bool,
    pub end_of_dir: bool,
    /// Active slots in this segment only.
    pub nb_active: usize,
    pub slots: Box<DirData>,
    pub first_cont: Option<Weak<CacheEntry>>,
    /// Last segment of the chain. `None` while the head is the only segment.
    pub last_segment: Option<Weak<CacheEntry>>,
    /// Number of continuation segments in the chain.
    pub nb_cont: u64,
}

/// Continuation segment of a cached directory.
#[derive(Debug)]
pub struct DirContData {
    pub head: Weak<CacheEntry>,
    pub prev: Weak<CacheEntry>,
    pub next: Option<Weak<CacheEntry>>,
    /// 1-based position in the chain; doubles as the table cookie.
    pub position: u64,
    pub end_of_dir: bool,
    pub nb_active: usize,
    pub slots: Box<DirData>,
}

#[derive(Debug)]
pub enum Payload {
    RegularFile(FileData),
    DirectoryHead(DirHeadData),
    DirectoryContinuation(DirContData),
    SymbolicLink(SymlinkData),
    Special(SpecialData),
    /// Freshly allocated, not yet populated.
    Unassigned,
    /// Torn down and returned to the pool.
    Recycled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    RegularFile,
    DirectoryHead,
    DirectoryContinuation,
    SymbolicLink,
    Socket,
    Fifo,
    BlockDevice,
    CharDevice,
    Unassigned,
    Recycled,
}

impl EntryType {
    /// Maps an FSAL node type to the entry type it is cached as. `Unknown`
    /// nodes have no cacheable representation.
    pub fn from_node_type(node_type: NodeType) -> Option<Self> {
        match node_type {
            NodeType::RegularFile => Some(Self::RegularFile),
            NodeType::Directory => Some(Self::DirectoryHead),
            NodeType::SymbolicLink => Some(Self::SymbolicLink),
            NodeType::Socket => Some(Self::Socket),
            NodeType::Fifo => Some(Self::Fifo),
            NodeType::BlockDevice => Some(Self::BlockDevice),
            NodeType::CharDevice => Some(Self::CharDevice),
            NodeType::Unknown => None,
        }
    }
}

impl Payload {
    pub fn entry_type(&self) -> EntryType {
        match self {
            Payload::RegularFile(_) => EntryType::RegularFile,
            Payload::DirectoryHead(_) => EntryType::DirectoryHead,
            Payload::DirectoryContinuation(_) => EntryType::DirectoryContinuation,
            Payload::SymbolicLink(_) => EntryType::SymbolicLink,
            Payload::Special(special) => match special.kind {
                SpecialKind::Socket => EntryType::Socket,
                SpecialKind::Fifo => EntryType::Fifo,
                SpecialKind::BlockDevice => EntryType::BlockDevice,
                SpecialKind::CharDevice => EntryType::CharDevice,
            },
            Payload::Unassigned => EntryType::Unassigned,
            Payload::Recycled => EntryType::Recycled,
        }
    }

    /// Attributes stored in this payload. Continuations carry none; theirs
    /// live in the owning head.
    pub fn attributes(&self) -> Option<&ObjectAttributes> {
        match self {
            Payload::RegularFile(file) => Some(&file.attributes),
            Payload::DirectoryHead(head) => Some(&head.attributes),
            Payload::SymbolicLink(link) => Some(&link.attributes),
            Payload::Special(special) => Some(&special.attributes),
            Payload::DirectoryContinuation(_) | Payload::Unassigned | Payload::Recycled => None,
        }
    }

    pub fn attributes_mut(&mut self) -> Option<&mut ObjectAttributes> {
        match self {
            Payload::RegularFile(file) => Some(&mut file.attributes),
            Payload::DirectoryHead(head) => Some(&mut head.attributes),
            Payload::SymbolicLink(link) => Some(&mut link.attributes),
            Payload::Special(special) => Some(&mut special.attributes),
            Payload::DirectoryContinuation(_) | Payload::Unassigned | Payload::Recycled => None,
        }
    }

    /// The FSAL handle this payload belongs to. Continuations resolve
    /// through their head and return `None` here.
    pub fn handle(&self) -> Option<&ObjectHandle> {
        match self {
            Payload::RegularFile(file) => Some(&file.handle),
            Payload::DirectoryHead(head) => Some(&head.handle),
            Payload::SymbolicLink(link) => Some(&link.handle),
            Payload::Special(special) => Some(&special.handle),
            Payload::DirectoryContinuation(_) | Payload::Unassigned | Payload::Recycled => None,
        }
    }
}

/// Back-link from an entry to one directory slot referencing it. An entry
/// has one link per hard link; an entry whose effective parent set is empty
/// is unlinked and awaits reclamation.
#[derive(Debug, Default, Clone)]
pub struct ParentLink {
    pub parent: Option<Weak<CacheEntry>>,
    pub slot: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid,
}

/// Registration of an entry with the LRU engine.
#[derive(Debug)]
pub struct GcRegistration {
    pub list: Weak<LruList>,
    pub token: LruToken,
}

/// Everything mutable about a cache entry, guarded by one lock.
#[derive(Debug)]
pub struct EntryState {
    pub validity: Validity,
    pub read_time: SystemTime,
    pub mod_time: SystemTime,
    pub refresh_time: SystemTime,
    pub alloc_time: SystemTime,
    pub payload: Payload,
    pub parent_list: Vec<ParentLink>,
    pub gc: Option<GcRegistration>,
}

impl EntryState {
    pub fn unassigned() -> Self {
        Self {
            validity: Validity::Invalid,
            read_time: UNIX_EPOCH,
            mod_time: UNIX_EPOCH,
            refresh_time: UNIX_EPOCH,
            alloc_time: UNIX_EPOCH,
            payload: Payload::Unassigned,
            parent_list: Vec::new(),
            gc: None,
        }
    }

    pub fn entry_type(&self) -> EntryType {
        self.payload.entry_type()
    }

    /// Most recent read or modification, whichever is later. Drives the
    /// unused-age reclamation policy.
    pub fn last_used(&self) -> SystemTime {
        self.read_time.max(self.mod_time)
    }
}

/// A cached filesystem object.
#[derive(Debug)]
pub struct CacheEntry {
    state: Mutex<EntryState>,
}

impl CacheEntry {
    pub fn with_state(state: EntryState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock()
    }

    /// Consume a uniquely owned entry and hand back its state. Used on
    /// unwind paths that must return payload blocks to the pool.
    pub fn try_into_state(this: Arc<Self>) -> Option<EntryState> {
        Arc::try_unwrap(this).ok().map(|e| e.state.into_inner())
    }
}

/// Key material (handle and cookie) identifying `entry` in the cache table.
///
/// For a continuation the handle lives in the owning head, which is locked
/// after the continuation per the global order.
pub fn key_material(entry: &Arc<CacheEntry>) -> Result<(ObjectHandle, Cookie), CacheError> {
    let state = entry.lock();
    match &state.payload {
        Payload::DirectoryContinuation(cont) => {
            let head = cont.head.upgrade().ok_or(CacheError::InconsistentEntry)?;
            let position = cont.position;
            let head_state = head.lock();
            match &head_state.payload {
                Payload::DirectoryHead(h) => Ok((h.handle.clone(), position)),
                _ => Err(CacheError::InconsistentEntry),
            }
        }
        Payload::Unassigned | Payload::Recycled => Err(CacheError::BadType),
        other => match other.handle() {
            Some(handle) => Ok((handle.clone(), DIR_START)),
            None => Err(CacheError::BadType),
        },
    }
}

/// Read the attributes of an entry. A continuation reports the attributes of
/// its owning head, locked continuation-first.
pub fn get_attributes(entry: &Arc<CacheEntry>) -> Result<ObjectAttributes, CacheError> {
    let state = entry.lock();
    match &state.payload {
        Payload::DirectoryContinuation(cont) => {
            let head = cont.head.upgrade().ok_or(CacheError::InconsistentEntry)?;
            let head_state = head.lock();
            match head_state.payload.attributes() {
                Some(attrs) => Ok(*attrs),
                None => Err(CacheError::InconsistentEntry),
            }
        }
        other => other.attributes().copied().ok_or(CacheError::BadType),
    }
}

/// Overwrite the attributes of an entry, following the same continuation
/// rule as [`get_attributes`].
pub fn set_attributes(
    entry: &Arc<CacheEntry>,
    attributes: ObjectAttributes,
) -> Result<(), CacheError> {
    let mut state = entry.lock();
    match &mut state.payload {
        Payload::DirectoryContinuation(cont) => {
            let head = cont.head.upgrade().ok_or(CacheError::InconsistentEntry)?;
            let mut head_state = head.lock();
            match head_state.payload.attributes_mut() {
                Some(slot) => {
                    *slot = attributes;
                    Ok(())
                }
                None => Err(CacheError::InconsistentEntry),
            }
        }
        other => match other.attributes_mut() {
            Some(slot) => {
                *slot = attributes;
                Ok(())
            }
            None => Err(CacheError::BadType),
        },
    }
}
