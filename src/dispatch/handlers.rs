//! Protocol handlers and the procedure descriptor table.

use std::sync::Arc;

use tracing::trace;

use super::export::Export;
use super::{DispatchFlags, ProcArgs, ProcResult, ProtoStatus, ReqStatus, SecurityContext};
use crate::cache::entry::EntryType;
use crate::cache::lifecycle::{new_entry, CreateArg};
use crate::cache::{dirent, entry, truncate, CacheClient, CacheEntry, CacheError, CacheKey,
    CacheTable};
use crate::fsal::{ObjectHandle, OpContext};

pub const PROC_NULL: usize = 0;
pub const PROC_GETATTR: usize = 1;
pub const PROC_SETATTR: usize = 2;
pub const PROC_RENAME: usize = 3;

const NOBODY: u32 = 65534;

/// Everything a handler sees about the request's surroundings.
pub struct RequestContext<'a> {
    pub export: &'a Export,
    pub security: Option<SecurityContext>,
    pub cache: &'a CacheClient,
    pub table: &'a CacheTable,
}

impl RequestContext<'_> {
    pub fn op_context(&self) -> OpContext {
        match self.security {
            Some(sec) => OpContext {
                uid: sec.uid,
                gid: sec.gid,
                export_id: self.export.id,
            },
            None => OpContext {
                uid: NOBODY,
                gid: NOBODY,
                export_id: self.export.id,
            },
        }
    }
}

pub type HandlerFn =
    Arc<dyn Fn(&ProcArgs, &RequestContext<'_>) -> (ReqStatus, ProcResult) + Send + Sync>;

/// One procedure: its name, dispatch properties, and implementation.
#[derive(Clone)]
pub struct ProcDesc {
    pub name: &'static str,
    pub flags: DispatchFlags,
    pub func: HandlerFn,
}

/// Procedure table indexed by procedure number.
pub struct HandlerTable {
    procs: Vec<ProcDesc>,
}

impl HandlerTable {
    pub fn new(procs: Vec<ProcDesc>) -> Self {
        Self { procs }
    }

    pub fn get(&self, proc_id: usize) -> Option<&ProcDesc> {
        self.procs.get(proc_id)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new(vec![
            ProcDesc {
                name: "null",
                flags: DispatchFlags::NOTHING_SPECIAL,
                func: Arc::new(proc_null),
            },
            ProcDesc {
                name: "getattr",
                flags: DispatchFlags::NEEDS_CRED | DispatchFlags::CAN_BE_DUP,
                func: Arc::new(proc_getattr),
            },
            ProcDesc {
                name: "setattr",
                flags: DispatchFlags::NEEDS_CRED
                    | DispatchFlags::MAKES_WRITE
                    | DispatchFlags::CAN_BE_DUP,
                func: Arc::new(proc_setattr),
            },
            ProcDesc {
                name: "rename",
                flags: DispatchFlags::NEEDS_CRED
                    | DispatchFlags::MAKES_WRITE
                    | DispatchFlags::CAN_BE_DUP,
                func: Arc::new(proc_rename),
            },
        ])
    }
}

/// Map a cache failure to a request conclusion. Transient failures are
/// dropped so the client retransmits into a healthier moment.
fn conclude(err: CacheError) -> (ReqStatus, ProcResult) {
    if err.is_transient() {
        (ReqStatus::Drop, ProcResult::Error(ProtoStatus::ServerFault))
    } else {
        (
            ReqStatus::Failed,
            ProcResult::Error(ProtoStatus::from_cache_error(&err)),
        )
    }
}

fn garbage_args() -> (ReqStatus, ProcResult) {
    (ReqStatus::Failed, ProcResult::Error(ProtoStatus::Invalid))
}

/// Find the cache entry for a handle, faulting it in from the backend on a
/// cold miss.
fn resolve_handle(
    rctx: &RequestContext<'_>,
    handle: &ObjectHandle,
) -> Result<Arc<CacheEntry>, CacheError> {
    let key = CacheKey::start(handle.clone());
    if let Some(hit) = rctx.table.lookup(&key) {
        return Ok(hit);
    }

    let ctx = rctx.op_context();
    let attrs = rctx
        .cache
        .fsal
        .get_attributes(handle, &ctx)
        .map_err(CacheError::from_fsal)?;
    let entry_type =
        EntryType::from_node_type(attrs.node_type).ok_or(CacheError::InconsistentType)?;
    // A symlink faulted in by handle gets its target on first readlink.
    let create_arg = if entry_type == EntryType::SymbolicLink {
        CreateArg::Symlink {
            target: String::new(),
        }
    } else {
        CreateArg::None
    };

    trace!("cold miss, faulting object into the cache");
    Ok(new_entry(
        rctx.cache,
        rctx.table,
        &key,
        entry_type,
        Some(attrs),
        create_arg,
        None,
        &ctx,
        false,
    )?
    .into_entry())
}

fn proc_null(_args: &ProcArgs, _rctx: &RequestContext<'_>) -> (ReqStatus, ProcResult) {
    (ReqStatus::Ok, ProcResult::Void)
}

fn proc_getattr(args: &ProcArgs, rctx: &RequestContext<'_>) -> (ReqStatus, ProcResult) {
    let ProcArgs::GetAttr { handle } = args else {
        return garbage_args();
    };

    let found = resolve_handle(rctx, handle).and_then(|e| entry::get_attributes(&e));
    match found {
        Ok(attrs) => (ReqStatus::Ok, ProcResult::Attrs(attrs)),
        Err(err) => conclude(err),
    }
}

fn proc_setattr(args: &ProcArgs, rctx: &RequestContext<'_>) -> (ReqStatus, ProcResult) {
    let ProcArgs::SetAttr { handle, new_size } = args else {
        return garbage_args();
    };

    let entry = match resolve_handle(rctx, handle) {
        Ok(entry) => entry,
        Err(err) => return conclude(err),
    };

    let result = match new_size {
        Some(length) => truncate::truncate(rctx.cache, rctx.table, &entry, *length, &rctx.op_context()),
        None => entry::get_attributes(&entry),
    };
    match result {
        Ok(attrs) => (ReqStatus::Ok, ProcResult::Attrs(attrs)),
        Err(err) => conclude(err),
    }
}

fn proc_rename(args: &ProcArgs, rctx: &RequestContext<'_>) -> (ReqStatus, ProcResult) {
    let ProcArgs::Rename {
        src_dir,
        src_name,
        dst_dir,
        dst_name,
    } = args
    else {
        return garbage_args();
    };

    let resolved = resolve_handle(rctx, src_dir)
        .and_then(|src| resolve_handle(rctx, dst_dir).map(|dst| (src, dst)));
    let (src, dst) = match resolved {
        Ok(pair) => pair,
        Err(err) => return conclude(err),
    };

    match dirent::rename_entry(
        rctx.cache,
        rctx.table,
        &src,
        src_name,
        &dst,
        dst_name,
        &rctx.op_context(),
    ) {
        Ok(()) => (ReqStatus::Ok, ProcResult::Void),
        Err(err) => conclude(err),
    }
}
