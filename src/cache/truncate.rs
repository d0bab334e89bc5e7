//! Truncation of cached regular files.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::warn;

use super::entry::{CacheEntry, EntryState, Payload};
use super::lifecycle::{self, valid, RenewOp};
use super::table::CacheTable;
use super::{CacheClient, CacheError};
use crate::fsal::{ObjectAttributes, OpContext};

/// Truncate a cached regular file to `length`, returning its refreshed
/// attributes.
///
/// When the file is attached to the content cache, truncation is delegated
/// there and the cached attributes are patched locally; otherwise the
/// backend does the work and its refreshed attributes replace ours. A stale
/// handle forcibly removes the entry before the error is reported.
pub fn truncate(
    client: &CacheClient,
    table: &CacheTable,
    entry: &Arc<CacheEntry>,
    length: u64,
    ctx: &OpContext,
) -> Result<ObjectAttributes, CacheError> {
    let result = {
        let mut state = entry.lock();
        truncate_no_lock(client, entry, &mut state, length, ctx)
    };

    if let Err(CacheError::StaleHandle) = result {
        warn!("backend reported a stale handle during truncation");
        if let Err(kill_err) = lifecycle::kill(client, table, entry) {
            warn!(%kill_err, "could not remove the stale entry");
        }
    }
    result
}

/// Truncation body for callers that already hold the entry lock.
///
/// Unlike [`truncate`], a stale handle is reported without removing the
/// entry, since removal needs the lock the caller is holding.
pub fn truncate_no_lock(
    client: &CacheClient,
    entry: &Arc<CacheEntry>,
    state: &mut EntryState,
    length: u64,
    ctx: &OpContext,
) -> Result<ObjectAttributes, CacheError> {
    client.stats.record_call();

    let outcome = apply_truncation(client, state, length, ctx);
    let attrs = match outcome {
        Ok(attrs) => attrs,
        Err(err) => {
            client.stats.record_error(&err);
            return Err(err);
        }
    };

    if let Err(err) = valid(client, entry, state, RenewOp::Set) {
        client.stats.record_error(&err);
        return Err(err);
    }

    client.stats.record_success();
    Ok(attrs)
}

fn apply_truncation(
    client: &CacheClient,
    state: &mut EntryState,
    length: u64,
    ctx: &OpContext,
) -> Result<ObjectAttributes, CacheError> {
    let file = match &mut state.payload {
        Payload::RegularFile(file) => file,
        _ => return Err(CacheError::BadType),
    };

    if let (Some(token), Some(content)) = (file.content, client.content.as_ref()) {
        content.truncate(token, length)?;
        let now = SystemTime::now();
        file.attributes.size = length;
        file.attributes.space_used = length;
        file.attributes.mtime = now;
        file.attributes.ctime = now;
        Ok(file.attributes)
    } else {
        let fresh = client
            .fsal
            .truncate(&file.handle, ctx, length)
            .map_err(CacheError::from_fsal)?;
        file.attributes = fresh;
        Ok(fresh)
    }
}
