//! Entry lifecycle: creation, revalidation, forced removal, and the
//! rename-compatibility rule.

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use tracing::{debug, trace, warn};

use super::entry::{
    CacheEntry, DirContData, DirData, DirHeadData, EntryState, EntryType, FdState, FileData,
    GcRegistration, ParentLink, Payload, SpecialData, SpecialKind, SymlinkData, Validity,
    DIR_SLOT_COUNT,
};
use super::key::CacheKey;
use super::table::{CacheTable, Insert};
use super::{CacheClient, CacheError};
use crate::fsal::{ObjectAttributes, OpContext};

/// What kind of access is renewing the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOp {
    Get,
    Set,
}

/// Creation payload details the attributes alone cannot carry.
#[derive(Debug, Clone)]
pub enum CreateArg {
    None,
    Symlink { target: String },
}

/// Result of [`new_entry`]. Finding the object already cached is not an
/// error; the caller gets the surviving entry either way.
#[derive(Debug)]
pub enum NewEntry {
    Created(Arc<CacheEntry>),
    Exists(Arc<CacheEntry>),
}

impl NewEntry {
    pub fn entry(&self) -> &Arc<CacheEntry> {
        match self {
            Self::Created(e) | Self::Exists(e) => e,
        }
    }

    pub fn into_entry(self) -> Arc<CacheEntry> {
        match self {
            Self::Created(e) | Self::Exists(e) => e,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Mark an entry valid and (re)register it with the LRU engine.
///
/// Called with the entry lock held. The previous registration, if any, is
/// invalidated first so the entry moves to the most-recently-used end. An
/// LRU failure here is fatal to the calling operation.
pub fn valid(
    client: &CacheClient,
    entry: &Arc<CacheEntry>,
    state: &mut EntryState,
    op: RenewOp,
) -> Result<(), CacheError> {
    if let Some(reg) = state.gc.take() {
        if let Some(list) = reg.list.upgrade() {
            // Invariant: a held registration always maps to a live slot,
            // since every path that invalidates one takes it out of
            // `state.gc` first and `gc_invalid` only removes invalidated
            // slots. A failure here means that broke; `new_entry` unwinds
            // the entry on it, other callers propagate and leave the entry
            // cached.
            list.invalidate(reg.token)?;
        }
    }

    let token = client.lru.register(entry);
    state.gc = Some(GcRegistration {
        list: Arc::downgrade(&client.lru),
        token,
    });
    state.validity = Validity::Valid;

    let now = SystemTime::now();
    match op {
        RenewOp::Get => state.read_time = now,
        RenewOp::Set => {
            state.mod_time = now;
            state.refresh_time = now;
        }
    }

    // Close a cached descriptor that has sat idle past the retention window.
    if client.use_fd_cache {
        if let Payload::RegularFile(file) = &mut state.payload {
            if file.fd.is_open() && file.fd.idle_longer_than(client.fd_retention) {
                trace!("closing idle cached descriptor");
                file.fd.close();
            }
        }
    }

    // Opportunistically drop slots already invalidated by earlier renewals.
    client.lru.gc_invalid(|_| {});

    Ok(())
}

/// Create a cache entry for the object addressed by `key`.
///
/// For [`EntryType::DirectoryContinuation`] the predecessor segment must be
/// supplied in `dir_chain_prev`; the new segment's chain position is derived
/// from it. Attributes are fetched from the backend when not supplied
/// (continuations excepted; theirs live in the head). A stale handle from
/// the backend triggers a best-effort forced removal of whatever entry is
/// cached under that handle before the error is reported.
#[allow(clippy::too_many_arguments)]
pub fn new_entry(
    client: &CacheClient,
    table: &CacheTable,
    key: &CacheKey,
    entry_type: EntryType,
    attributes: Option<ObjectAttributes>,
    create_arg: CreateArg,
    dir_chain_prev: Option<&Arc<CacheEntry>>,
    ctx: &OpContext,
    is_new_object: bool,
) -> Result<NewEntry, CacheError> {
    client.stats.record_call();

    if let Some(existing) = table.lookup(key) {
        trace!(cookie = key.cookie, "object already cached");
        client.stats.record_success();
        return Ok(NewEntry::Exists(existing));
    }

    if let Err(err) = client.pool.acquire_entry() {
        let err = CacheError::from(err);
        client.stats.record_error(&err);
        return Err(err);
    }
    if let Err(err) = client.pool.acquire_parent_links(1) {
        client.pool.release_entry();
        let err = CacheError::from(err);
        client.stats.record_error(&err);
        return Err(err);
    }

    let needs_dir_block = matches!(
        entry_type,
        EntryType::DirectoryHead | EntryType::DirectoryContinuation
    );
    let mut dir_block: Option<Box<DirData>> = if needs_dir_block {
        match client.pool.acquire_dir_block() {
            Ok(block) => Some(block),
            Err(err) => {
                client.pool.release_parent_links(1);
                client.pool.release_entry();
                let err = CacheError::from(err);
                client.stats.record_error(&err);
                return Err(err);
            }
        }
    } else {
        None
    };

    // Everything past this point unwinds through `release_on_error`.
    let built = build_payload(
        client,
        table,
        key,
        entry_type,
        attributes,
        create_arg,
        dir_chain_prev,
        ctx,
        &mut dir_block,
    );
    let payload = match built {
        Ok(payload) => payload,
        Err(err) => {
            if let Some(block) = dir_block.take() {
                client.pool.release_dir_block(block);
            }
            client.pool.release_parent_links(1);
            client.pool.release_entry();
            client.stats.record_error(&err);
            return Err(err);
        }
    };

    let now = SystemTime::now();
    let entry = CacheEntry::with_state(EntryState {
        validity: Validity::Invalid,
        read_time: now,
        mod_time: now,
        refresh_time: now,
        alloc_time: now,
        payload,
        parent_list: vec![ParentLink::default()],
        gc: None,
    });

    match table.insert_if_absent(key.to_owned_key(), entry.clone()) {
        Insert::AlreadyPresent(existing) => {
            // Lost the creation race; the winner's entry is authoritative.
            trace!(cookie = key.cookie, "lost creation race");
            release_entry_blocks(client, entry);
            client.stats.record_success();
            return Ok(NewEntry::Exists(existing));
        }
        Insert::Inserted => {}
    }

    {
        let mut state = entry.lock();

        // An object that predates this cache run may have content surviving
        // in the secondary cache; re-attach it and trust its size.
        if !is_new_object {
            if let (Payload::RegularFile(file), Some(content)) =
                (&mut state.payload, client.content.as_ref())
            {
                if content.test_cached(&file.handle) {
                    match content.recover(&file.handle) {
                        Ok(token) => {
                            file.content = Some(token);
                            if let Some(size) = content.cached_size(token) {
                                file.attributes.size = size;
                                file.attributes.space_used = size;
                            }
                            debug!("re-attached surviving cached content");
                        }
                        Err(err) => warn!(%err, "failed to recover cached content"),
                    }
                }
            }
        }

        if let Err(err) = valid(client, &entry, &mut state, RenewOp::Get) {
            drop(state);
            if let Err(remove_err) = table.remove(key) {
                warn!(%remove_err, "could not unwind table insertion");
            }
            release_entry_blocks(client, entry);
            client.stats.record_error(&err);
            return Err(err);
        }
    }

    trace!(entry_type = ?entry_type, cookie = key.cookie, "created cache entry");
    client.stats.record_success();
    Ok(NewEntry::Created(entry))
}

#[allow(clippy::too_many_arguments)]
fn build_payload(
    client: &CacheClient,
    table: &CacheTable,
    key: &CacheKey,
    entry_type: EntryType,
    attributes: Option<ObjectAttributes>,
    create_arg: CreateArg,
    dir_chain_prev: Option<&Arc<CacheEntry>>,
    ctx: &OpContext,
    dir_block: &mut Option<Box<DirData>>,
) -> Result<Payload, CacheError> {
    let attributes = match attributes {
        Some(attrs) => Some(attrs),
        None if entry_type != EntryType::DirectoryContinuation => {
            match client.fsal.get_attributes(&key.handle, ctx) {
                Ok(attrs) => Some(attrs),
                Err(fsal_err) => {
                    let err = CacheError::from_fsal(fsal_err);
                    if err == CacheError::StaleHandle {
                        warn!("backend reported a stale handle during creation");
                        if let Some(previous) = table.lookup(&CacheKey::start(key.handle.clone()))
                        {
                            if let Err(kill_err) = kill(client, table, &previous) {
                                warn!(%kill_err, "could not remove stale predecessor entry");
                            }
                        }
                    }
                    return Err(err);
                }
            }
        }
        None => None,
    };

    match entry_type {
        EntryType::RegularFile => Ok(Payload::RegularFile(FileData {
            handle: key.handle.clone(),
            attributes: attributes.ok_or(CacheError::InvalidArgument)?,
            content: None,
            fd: FdState::default(),
        })),

        EntryType::DirectoryHead => Ok(Payload::DirectoryHead(DirHeadData {
            handle: key.handle.clone(),
            attributes: attributes.ok_or(CacheError::InvalidArgument)?,
            has_been_readdir: false,
            end_of_dir: false,
            nb_active: 0,
            slots: dir_block.take().ok_or(CacheError::InconsistentEntry)?,
            first_cont: None,
            last_segment: None,
            nb_cont: 0,
        })),

        EntryType::DirectoryContinuation => {
            let prev = dir_chain_prev.ok_or(CacheError::InvalidArgument)?;
            let (head, position) = {
                let prev_state = prev.lock();
                match &prev_state.payload {
                    Payload::DirectoryHead(_) => (Arc::downgrade(prev), 1),
                    Payload::DirectoryContinuation(cont) => (cont.head.clone(), cont.position + 1),
                    _ => return Err(CacheError::NotADirectory),
                }
            };
            if position != key.cookie {
                warn!(
                    position,
                    cookie = key.cookie,
                    "continuation key cookie disagrees with chain position"
                );
            }
            Ok(Payload::DirectoryContinuation(DirContData {
                head,
                prev: Arc::downgrade(prev),
                next: None,
                position,
                end_of_dir: false,
                nb_active: 0,
                slots: dir_block.take().ok_or(CacheError::InconsistentEntry)?,
            }))
        }

        EntryType::SymbolicLink => {
            let target = match create_arg {
                CreateArg::Symlink { target } => target,
                CreateArg::None => return Err(CacheError::InvalidArgument),
            };
            Ok(Payload::SymbolicLink(SymlinkData {
                handle: key.handle.clone(),
                attributes: attributes.ok_or(CacheError::InvalidArgument)?,
                target,
            }))
        }

        EntryType::Socket | EntryType::Fifo | EntryType::BlockDevice | EntryType::CharDevice => {
            let kind = match entry_type {
                EntryType::Socket => SpecialKind::Socket,
                EntryType::Fifo => SpecialKind::Fifo,
                EntryType::BlockDevice => SpecialKind::BlockDevice,
                _ => SpecialKind::CharDevice,
            };
            Ok(Payload::Special(SpecialData {
                handle: key.handle.clone(),
                attributes: attributes.ok_or(CacheError::InvalidArgument)?,
                kind,
            }))
        }

        EntryType::Unassigned | EntryType::Recycled => Err(CacheError::InvalidArgument),
    }
}

/// Forcibly remove an entry from the cache.
///
/// A directory head takes its whole continuation chain down first
/// (iteratively; continuations have no chains of their own). Parent
/// directory slots referencing the entry are invalidated, the table binding
/// is removed, backend and content-cache resources are released, and the
/// entry's blocks go back to the pool with the payload scrubbed to
/// `Recycled`.
pub fn kill(
    client: &CacheClient,
    table: &CacheTable,
    entry: &Arc<CacheEntry>,
) -> Result<(), CacheError> {
    let (handle, cookie) = key_material_for_kill(entry)?;
    let key = CacheKey::borrowed(&handle, cookie);

    let (entry_type, parents, first_cont) = {
        let state = entry.lock();
        let first_cont = match &state.payload {
            Payload::DirectoryHead(head) => head.first_cont.clone(),
            _ => None,
        };
        (state.entry_type(), state.parent_list.clone(), first_cont)
    };

    if entry_type == EntryType::DirectoryHead {
        // Walk the chain collecting segments one lock at a time, then take
        // them down before the head itself.
        let mut chain = Vec::new();
        let mut cursor = first_cont.and_then(|weak| weak.upgrade());
        while let Some(cont) = cursor {
            let next = {
                let cont_state = cont.lock();
                match &cont_state.payload {
                    Payload::DirectoryContinuation(data) => data.next.clone(),
                    _ => None,
                }
            };
            cursor = next.and_then(|weak| weak.upgrade());
            chain.push(cont);
        }
        for cont in chain {
            if let Err(err) = kill(client, table, &cont) {
                warn!(%err, "failed to remove a continuation segment");
            }
        }
    }

    invalidate_related_dirents(entry, &parents);

    match table.remove(&key) {
        Ok(removed) => {
            if !Arc::ptr_eq(&removed, entry) {
                warn!(cookie, "table binding did not match the entry being removed");
            }
        }
        Err(err) => {
            warn!(cookie, "entry missing from the cache table during removal");
            return Err(err);
        }
    }

    if let Err(err) = client.fsal.clean_object_resources(&handle) {
        warn!(%err, "backend resource cleanup failed");
    }

    // Scrub the entry and return its blocks.
    let content_token = {
        let mut state = entry.lock();

        if let Some(reg) = state.gc.take() {
            if let Some(list) = reg.list.upgrade() {
                if let Err(err) = list.invalidate(reg.token) {
                    debug!(%err, "lru registration was already gone");
                }
            }
        }

        let links = state.parent_list.len();
        state.parent_list.clear();
        client.pool.release_parent_links(links);

        let payload = std::mem::replace(&mut state.payload, Payload::Recycled);
        let content_token = match &payload {
            Payload::RegularFile(file) => file.content,
            _ => None,
        };
        match payload {
            Payload::DirectoryHead(head) => client.pool.release_dir_block(head.slots),
            Payload::DirectoryContinuation(cont) => client.pool.release_dir_block(cont.slots),
            _ => {}
        }
        state.validity = Validity::Invalid;
        content_token
    };

    if let (Some(token), Some(content)) = (content_token, client.content.as_ref()) {
        if let Err(err) = content.release(token) {
            warn!(%err, "content cache release failed");
        }
    }

    client.pool.release_entry();
    trace!(cookie, "removed cache entry");
    Ok(())
}

/// Key material for a forced removal. Unpopulated entries cannot be killed.
fn key_material_for_kill(
    entry: &Arc<CacheEntry>,
) -> Result<(crate::fsal::ObjectHandle, u64), CacheError> {
    match super::entry::key_material(entry) {
        Ok(material) => Ok(material),
        Err(CacheError::BadType) => Err(CacheError::InvalidArgument),
        Err(err) => Err(err),
    }
}

/// Clear every parent directory slot that still names this entry.
fn invalidate_related_dirents(entry: &Arc<CacheEntry>, parents: &[ParentLink]) {
    for link in parents {
        let Some(parent) = link.parent.as_ref().and_then(Weak::upgrade) else {
            continue;
        };
        if link.slot >= DIR_SLOT_COUNT {
            warn!(slot = link.slot, "parent back-link slot out of range");
            continue;
        }

        let mut parent_state = parent.lock();
        let owning_head = match &mut parent_state.payload {
            Payload::DirectoryHead(head) => {
                let slot = &mut head.slots.slots[link.slot];
                if slot.active && slot_points_at(slot.child.as_ref(), entry) {
                    slot.active = false;
                    slot.name.clear();
                    slot.child = None;
                    head.nb_active = head.nb_active.saturating_sub(1);
                }
                head.has_been_readdir = false;
                None
            }
            Payload::DirectoryContinuation(cont) => {
                let slot = &mut cont.slots.slots[link.slot];
                if slot.active && slot_points_at(slot.child.as_ref(), entry) {
                    slot.active = false;
                    slot.name.clear();
                    slot.child = None;
                    cont.nb_active = cont.nb_active.saturating_sub(1);
                }
                // The materialized-listing flag lives in the head.
                cont.head.upgrade()
            }
            // A parent torn down ahead of its children leaves recycled
            // segments behind; nothing left to clear.
            Payload::Recycled => continue,
            _ => {
                warn!("parent back-link does not reference a directory segment");
                continue;
            }
        };
        drop(parent_state);

        if let Some(head) = owning_head {
            let mut head_state = head.lock();
            if let Payload::DirectoryHead(data) = &mut head_state.payload {
                data.has_been_readdir = false;
            }
        }
    }
}

fn slot_points_at(child: Option<&Weak<CacheEntry>>, entry: &Arc<CacheEntry>) -> bool {
    child.is_some_and(|weak| weak.upgrade().is_some_and(|c| Arc::ptr_eq(&c, entry)))
}

/// Whether `src` may be renamed over `dest`.
///
/// The rule is asymmetric: a directory source requires an empty directory
/// destination, while a non-directory source tolerates any non-directory
/// destination. Continuation segments stand in for their heads.
pub fn are_rename_compatible(src: &Arc<CacheEntry>, dest: &Arc<CacheEntry>) -> bool {
    let Some(src) = resolve_to_head(src) else {
        return false;
    };
    let Some(dest) = resolve_to_head(dest) else {
        return false;
    };

    let src_is_dir = src.lock().entry_type() == EntryType::DirectoryHead;
    let dest_is_dir = dest.lock().entry_type() == EntryType::DirectoryHead;

    match (src_is_dir, dest_is_dir) {
        (true, true) => directory_is_empty(&dest),
        (true, false) | (false, true) => false,
        (false, false) => true,
    }
}

/// Resolve a directory continuation to its head; other entries resolve to
/// themselves.
pub fn resolve_to_head(entry: &Arc<CacheEntry>) -> Option<Arc<CacheEntry>> {
    let state = entry.lock();
    match &state.payload {
        Payload::DirectoryContinuation(cont) => cont.head.upgrade(),
        _ => Some(entry.clone()),
    }
}

/// Whether a directory head and its whole chain hold no active dirents.
pub fn directory_is_empty(head: &Arc<CacheEntry>) -> bool {
    let first_cont = {
        let state = head.lock();
        match &state.payload {
            Payload::DirectoryHead(data) => {
                if data.nb_active > 0 {
                    return false;
                }
                data.first_cont.clone()
            }
            _ => return false,
        }
    };

    let mut cursor = first_cont.and_then(|weak| weak.upgrade());
    while let Some(cont) = cursor {
        let next = {
            let state = cont.lock();
            match &state.payload {
                Payload::DirectoryContinuation(data) => {
                    if data.nb_active > 0 {
                        return false;
                    }
                    data.next.clone()
                }
                _ => None,
            }
        };
        cursor = next.and_then(|weak| weak.upgrade());
    }
    true
}

/// Return a uniquely owned, never-published entry's blocks to the pool.
fn release_entry_blocks(client: &CacheClient, entry: Arc<CacheEntry>) {
    match CacheEntry::try_into_state(entry) {
        Some(mut state) => {
            let links = state.parent_list.len();
            match std::mem::replace(&mut state.payload, Payload::Recycled) {
                Payload::DirectoryHead(head) => client.pool.release_dir_block(head.slots),
                Payload::DirectoryContinuation(cont) => client.pool.release_dir_block(cont.slots),
                _ => {}
            }
            client.pool.release_parent_links(links);
            client.pool.release_entry();
        }
        None => warn!("entry unexpectedly shared while unwinding creation"),
    }
}
