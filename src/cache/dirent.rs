//! Directory entry operations across a head segment and its continuation
//! chain.
//!
//! Every operation accepts either the head or any continuation of the
//! directory and resolves to the head before working. Slot reservation and
//! child back-link updates are two separate lock acquisitions, never nested.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{trace, warn};

use super::entry::{CacheEntry, EntryType, ParentLink, Payload};
use super::key::CacheKey;
use super::lifecycle::{
    self, are_rename_compatible, new_entry, resolve_to_head, valid, CreateArg, RenewOp,
};
use super::table::CacheTable;
use super::{CacheClient, CacheError};
use crate::fsal::{ObjectHandle, OpContext};

fn require_dir_head(dir: &Arc<CacheEntry>) -> Result<Arc<CacheEntry>, CacheError> {
    let head = resolve_to_head(dir).ok_or(CacheError::InconsistentEntry)?;
    if head.lock().entry_type() != EntryType::DirectoryHead {
        return Err(CacheError::NotADirectory);
    }
    Ok(head)
}

/// Find the child entry a directory names, searching the head segment and
/// then the continuation chain.
pub fn lookup_dirent(dir: &Arc<CacheEntry>, name: &str) -> Option<Arc<CacheEntry>> {
    let head = resolve_to_head(dir)?;

    let (hit, first_cont) = {
        let state = head.lock();
        match &state.payload {
            Payload::DirectoryHead(data) => {
                let hit = data
                    .slots
                    .find_active(name)
                    .and_then(|i| data.slots.slots[i].child.as_ref())
                    .and_then(|weak| weak.upgrade());
                (hit, data.first_cont.clone())
            }
            _ => return None,
        }
    };
    if hit.is_some() {
        return hit;
    }

    let mut cursor = first_cont.and_then(|weak| weak.upgrade());
    while let Some(cont) = cursor {
        let (hit, next) = {
            let state = cont.lock();
            match &state.payload {
                Payload::DirectoryContinuation(data) => {
                    let hit = data
                        .slots
                        .find_active(name)
                        .and_then(|i| data.slots.slots[i].child.as_ref())
                        .and_then(|weak| weak.upgrade());
                    (hit, data.next.clone())
                }
                _ => (None, None),
            }
        };
        if hit.is_some() {
            return hit;
        }
        cursor = next.and_then(|weak| weak.upgrade());
    }
    None
}

/// Bind `name` to `child` inside `dir`, growing the continuation chain by
/// one segment when every existing slot is taken.
pub fn add_dirent(
    client: &CacheClient,
    table: &CacheTable,
    dir: &Arc<CacheEntry>,
    name: &str,
    child: &Arc<CacheEntry>,
    ctx: &OpContext,
) -> Result<(), CacheError> {
    let head = require_dir_head(dir)?;

    let mut reserved = try_reserve_slot(&head, name, child);
    if reserved.is_none() {
        let segment = grow_chain(client, table, &head, ctx)?;
        reserved = reserve_in_segment(&segment, name, child);
    }
    let Some((segment, slot)) = reserved else {
        // A racing add filled the fresh segment already.
        return Err(CacheError::InconsistentEntry);
    };

    // Back-link the child to the slot that now names it. The record
    // allocated at creation is reused first; further hard links take a new
    // one from the pool.
    let link = ParentLink {
        parent: Some(Arc::downgrade(&segment)),
        slot,
    };
    let needs_record = {
        let mut child_state = child.lock();
        match child_state
            .parent_list
            .iter_mut()
            .find(|l| l.parent.is_none())
        {
            Some(empty) => {
                *empty = link.clone();
                false
            }
            None => true,
        }
    };
    if needs_record {
        if let Err(err) = client.pool.acquire_parent_links(1) {
            unreserve_slot(&segment, slot);
            return Err(err.into());
        }
        child.lock().parent_list.push(link);
    }

    trace!(name, slot, "added directory entry");
    Ok(())
}

/// Unbind `name` from `dir` and return the child it named. The slot is
/// cleared even when the child entry is already gone.
pub fn remove_dirent(dir: &Arc<CacheEntry>, name: &str) -> Result<Arc<CacheEntry>, CacheError> {
    let head = require_dir_head(dir)?;

    let mut segment = head.clone();
    let child = loop {
        let (cleared, next) = {
            let mut state = segment.lock();
            match &mut state.payload {
                Payload::DirectoryHead(data) => match data.slots.find_active(name) {
                    Some(i) => {
                        let slot = &mut data.slots.slots[i];
                        let child = slot.child.take().and_then(|weak| weak.upgrade());
                        slot.active = false;
                        slot.name.clear();
                        data.nb_active = data.nb_active.saturating_sub(1);
                        data.has_been_readdir = false;
                        (Some((i, child)), None)
                    }
                    None => (None, data.first_cont.clone()),
                },
                Payload::DirectoryContinuation(data) => match data.slots.find_active(name) {
                    Some(i) => {
                        let slot = &mut data.slots.slots[i];
                        let child = slot.child.take().and_then(|weak| weak.upgrade());
                        slot.active = false;
                        slot.name.clear();
                        data.nb_active = data.nb_active.saturating_sub(1);
                        (Some((i, child)), None)
                    }
                    None => (None, data.next.clone()),
                },
                _ => return Err(CacheError::InconsistentEntry),
            }
        };

        match cleared {
            Some((slot, child)) => {
                if !Arc::ptr_eq(&segment, &head) {
                    // Listing state lives in the head.
                    let mut head_state = head.lock();
                    if let Payload::DirectoryHead(data) = &mut head_state.payload {
                        data.has_been_readdir = false;
                    }
                }
                let child = child.ok_or(CacheError::NotFound)?;
                blank_parent_link(&child, &segment, slot);
                break child;
            }
            None => match next.and_then(|weak| weak.upgrade()) {
                Some(cont) => segment = cont,
                None => return Err(CacheError::NotFound),
            },
        }
    };

    trace!(name, "removed directory entry");
    Ok(child)
}

/// Move `src_name` in `src_dir` to `dst_name` in `dst_dir`.
///
/// An existing destination must be rename-compatible with the source; it is
/// unbound and, once nothing names it anymore, forcibly removed. A failed
/// destination add restores the source binding, so the child stays reachable
/// under its old name.
pub fn rename_entry(
    client: &CacheClient,
    table: &CacheTable,
    src_dir: &Arc<CacheEntry>,
    src_name: &str,
    dst_dir: &Arc<CacheEntry>,
    dst_name: &str,
    ctx: &OpContext,
) -> Result<(), CacheError> {
    let src_head = require_dir_head(src_dir)?;
    let dst_head = require_dir_head(dst_dir)?;

    let child = lookup_dirent(&src_head, src_name).ok_or(CacheError::NotFound)?;

    if let Some(existing) = lookup_dirent(&dst_head, dst_name) {
        if Arc::ptr_eq(&existing, &child) {
            return Ok(());
        }
        if !are_rename_compatible(&child, &existing) {
            return Err(CacheError::Exists);
        }
        remove_dirent(&dst_head, dst_name)?;
        if !has_effective_parent(&existing) {
            if let Err(err) = lifecycle::kill(client, table, &existing) {
                warn!(%err, "could not remove the replaced destination entry");
            }
        }
    }

    let child = remove_dirent(&src_head, src_name)?;
    if let Err(err) = add_dirent(client, table, &dst_head, dst_name, &child, ctx) {
        // The source slot and back-link record were freed just above, so
        // putting the binding back cannot hit the pool.
        if let Err(restore_err) = add_dirent(client, table, &src_head, src_name, &child, ctx) {
            warn!(%restore_err, "could not restore the source binding after a failed rename");
        }
        return Err(err);
    }

    let now = SystemTime::now();
    for dir in [&src_head, &dst_head] {
        let mut state = dir.lock();
        if let Some(attrs) = state.payload.attributes_mut() {
            attrs.mtime = now;
            attrs.ctime = now;
        }
        valid(client, dir, &mut state, RenewOp::Set)?;
    }

    trace!(src_name, dst_name, "renamed directory entry");
    Ok(())
}

fn has_effective_parent(entry: &Arc<CacheEntry>) -> bool {
    entry
        .lock()
        .parent_list
        .iter()
        .any(|link| link.parent.as_ref().is_some_and(|w| w.strong_count() > 0))
}

/// Reserve a free slot anywhere in the existing chain.
fn try_reserve_slot(
    head: &Arc<CacheEntry>,
    name: &str,
    child: &Arc<CacheEntry>,
) -> Option<(Arc<CacheEntry>, usize)> {
    let mut segment = head.clone();
    loop {
        let (taken, next) = {
            let mut state = segment.lock();
            match &mut state.payload {
                Payload::DirectoryHead(data) => match data.slots.first_free_slot() {
                    Some(i) => {
                        fill_slot(&mut data.slots.slots[i], name, child);
                        data.nb_active += 1;
                        (Some(i), None)
                    }
                    None => (None, data.first_cont.clone()),
                },
                Payload::DirectoryContinuation(data) => match data.slots.first_free_slot() {
                    Some(i) => {
                        fill_slot(&mut data.slots.slots[i], name, child);
                        data.nb_active += 1;
                        (Some(i), None)
                    }
                    None => (None, data.next.clone()),
                },
                _ => (None, None),
            }
        };
        if let Some(slot) = taken {
            return Some((segment, slot));
        }
        match next.and_then(|weak| weak.upgrade()) {
            Some(cont) => segment = cont,
            None => return None,
        }
    }
}

fn reserve_in_segment(
    segment: &Arc<CacheEntry>,
    name: &str,
    child: &Arc<CacheEntry>,
) -> Option<(Arc<CacheEntry>, usize)> {
    let mut state = segment.lock();
    match &mut state.payload {
        Payload::DirectoryContinuation(data) => data.slots.first_free_slot().map(|i| {
            fill_slot(&mut data.slots.slots[i], name, child);
            data.nb_active += 1;
            (segment.clone(), i)
        }),
        _ => None,
    }
}

fn fill_slot(slot: &mut super::entry::DirSlot, name: &str, child: &Arc<CacheEntry>) {
    slot.active = true;
    slot.name.clear();
    slot.name.push_str(name);
    slot.child = Some(Arc::downgrade(child));
}

fn unreserve_slot(segment: &Arc<CacheEntry>, slot: usize) {
    let mut state = segment.lock();
    let data = match &mut state.payload {
        Payload::DirectoryHead(d) => {
            d.nb_active = d.nb_active.saturating_sub(1);
            &mut d.slots.slots[slot]
        }
        Payload::DirectoryContinuation(d) => {
            d.nb_active = d.nb_active.saturating_sub(1);
            &mut d.slots.slots[slot]
        }
        _ => return,
    };
    data.active = false;
    data.name.clear();
    data.child = None;
}

/// Append one continuation segment to the chain and return it.
fn grow_chain(
    client: &CacheClient,
    table: &CacheTable,
    head: &Arc<CacheEntry>,
    ctx: &OpContext,
) -> Result<Arc<CacheEntry>, CacheError> {
    let (handle, position, last): (ObjectHandle, u64, Arc<CacheEntry>) = {
        let state = head.lock();
        match &state.payload {
            Payload::DirectoryHead(data) => {
                let last = data
                    .last_segment
                    .as_ref()
                    .and_then(|weak| weak.upgrade())
                    .unwrap_or_else(|| head.clone());
                (data.handle.clone(), data.nb_cont + 1, last)
            }
            _ => return Err(CacheError::NotADirectory),
        }
    };

    let key = CacheKey::for_continuation(handle, position);
    let segment = new_entry(
        client,
        table,
        &key,
        EntryType::DirectoryContinuation,
        None,
        CreateArg::None,
        Some(&last),
        ctx,
        true,
    )?
    .into_entry();

    // Splice the segment in: predecessor forward link, then head chain
    // bookkeeping.
    {
        let mut prev_state = last.lock();
        match &mut prev_state.payload {
            Payload::DirectoryHead(data) => data.first_cont = Some(Arc::downgrade(&segment)),
            Payload::DirectoryContinuation(data) => data.next = Some(Arc::downgrade(&segment)),
            _ => return Err(CacheError::InconsistentEntry),
        }
    }
    {
        let mut head_state = head.lock();
        if let Payload::DirectoryHead(data) = &mut head_state.payload {
            if data.first_cont.is_none() {
                data.first_cont = Some(Arc::downgrade(&segment));
            }
            data.last_segment = Some(Arc::downgrade(&segment));
            data.nb_cont = position;
        }
    }

    trace!(position, "grew directory continuation chain");
    Ok(segment)
}

/// Blank the child's back-link for one slot; the record stays allocated for
/// reuse by a later link.
fn blank_parent_link(child: &Arc<CacheEntry>, segment: &Arc<CacheEntry>, slot: usize) {
    let mut state = child.lock();
    for link in &mut state.parent_list {
        let matches = link.slot == slot
            && link
                .parent
                .as_ref()
                .and_then(|weak| weak.upgrade())
                .is_some_and(|p| Arc::ptr_eq(&p, segment));
        if matches {
            *link = ParentLink::default();
            return;
        }
    }
}
