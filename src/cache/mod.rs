//! In-memory metadata cache.
//!
//! Structure mirrors the object model: [`key`] addresses entries, [`pool`]
//! bounds their storage, [`table`] owns them, [`entry`] defines them, and
//! [`lifecycle`]/[`dirent`]/[`truncate`]/[`gc`] mutate them. The [`lru`]
//! engine decides what to reclaim; the cache decides how.
//!
//! Locking rules, in force everywhere:
//! - shared structures (table, pool, LRU) each have their own lock and are
//!   never held across a call into another component that takes entry locks;
//! - entry locks nest in exactly one direction: a continuation segment
//!   first, then the head reached through its back-link;
//! - no path holds two sibling entry locks at once.

pub mod dirent;
pub mod entry;
pub mod gc;
pub mod key;
pub mod lifecycle;
pub mod lru;
pub mod pool;
pub mod table;
pub mod truncate;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use entry::{CacheEntry, EntryState, EntryType, Payload, Validity};
pub use key::CacheKey;
pub use lru::{LruError, LruList, LruToken};
pub use pool::{EntryPool, PoolExhausted};
pub use table::CacheTable;

use crate::fsal::{ContentCache, ContentError, Fsal, FsalError};

/// Cache-layer error taxonomy.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("entry not found")]
    NotFound,
    #[error("operation does not apply to this entry type")]
    BadType,
    #[error("entry already exists")]
    Exists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirNotEmpty,
    #[error("stale object handle")]
    StaleHandle,
    #[error("access denied")]
    Access,
    #[error("no space on backing store")]
    NoSpace,
    #[error("quota exceeded")]
    Quota,
    #[error("read-only filesystem")]
    ReadOnlyFs,
    #[error("security context rejected")]
    Security,
    #[error("backend I/O failure")]
    Io,
    #[error("backend asked for a retry")]
    Delay,
    #[error(transparent)]
    Allocation(#[from] PoolExhausted),
    #[error(transparent)]
    Lru(#[from] LruError),
    #[error("content cache failure: {0}")]
    Content(#[from] ContentError),
    #[error("backend reported an unclassifiable node type")]
    InconsistentType,
    #[error("cache entry is internally inconsistent")]
    InconsistentEntry,
}

impl CacheError {
    /// Convert a backend error into the cache taxonomy.
    pub fn from_fsal(err: FsalError) -> Self {
        match err {
            FsalError::NotFound => Self::NotFound,
            FsalError::Exists => Self::Exists,
            FsalError::Access => Self::Access,
            FsalError::Perm => Self::Access,
            FsalError::NotDir => Self::NotADirectory,
            FsalError::IsDir => Self::IsADirectory,
            FsalError::NotEmpty => Self::DirNotEmpty,
            FsalError::NoSpace => Self::NoSpace,
            FsalError::ReadOnly => Self::ReadOnlyFs,
            FsalError::Stale => Self::StaleHandle,
            FsalError::QuotaExceeded => Self::Quota,
            FsalError::Security => Self::Security,
            FsalError::Invalid => Self::InvalidArgument,
            FsalError::Io => Self::Io,
            FsalError::Delay => Self::Delay,
        }
    }

    /// Whether retrying later could succeed. Transient failures are dropped
    /// at the dispatch layer rather than answered.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Allocation(_) | Self::Lru(_) | Self::Delay)
    }
}

/// Per-client operation counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    nb_calls: AtomicU64,
    nb_success: AtomicU64,
    nb_retryable: AtomicU64,
    nb_unrecoverable: AtomicU64,
}

impl CacheStats {
    pub fn record_call(&self) {
        self.nb_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.nb_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: &CacheError) {
        if err.is_transient() {
            self.nb_retryable.fetch_add(1, Ordering::Relaxed);
        } else {
            self.nb_unrecoverable.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn calls(&self) -> u64 {
        self.nb_calls.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.nb_success.load(Ordering::Relaxed)
    }

    pub fn retryable_errors(&self) -> u64 {
        self.nb_retryable.load(Ordering::Relaxed)
    }

    pub fn unrecoverable_errors(&self) -> u64 {
        self.nb_unrecoverable.load(Ordering::Relaxed)
    }
}

/// Handle a caller uses to drive the cache: the backend, the shared pool and
/// LRU engine, the optional content cache, and fd-retention policy.
///
/// Cloning is cheap; workers each hold their own clone over the same shared
/// structures.
#[derive(Clone)]
pub struct CacheClient {
    pub fsal: Arc<dyn Fsal>,
    pub pool: Arc<EntryPool>,
    pub lru: Arc<LruList>,
    pub content: Option<Arc<dyn ContentCache>>,
    pub use_fd_cache: bool,
    pub fd_retention: Duration,
    pub stats: Arc<CacheStats>,
}

impl CacheClient {
    pub fn new(fsal: Arc<dyn Fsal>, pool: Arc<EntryPool>, lru: Arc<LruList>) -> Self {
        Self {
            fsal,
            pool,
            lru,
            content: None,
            use_fd_cache: false,
            fd_retention: Duration::from_secs(30),
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn with_content(mut self, content: Arc<dyn ContentCache>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_fd_cache(mut self, retention: Duration) -> Self {
        self.use_fd_cache = true;
        self.fd_retention = retention;
        self
    }
}
