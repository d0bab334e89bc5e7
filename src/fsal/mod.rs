//! Filesystem abstraction layer (FSAL).
//!
//! The cache never talks to a concrete backend directly; it goes through the
//! [`Fsal`] trait. Object handles are opaque byte strings minted by the
//! backend in canonical form; the cache compares them byte for byte.

use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;

/// Directory iteration cookie.
pub type Cookie = u64;

/// Cookie of a directory head segment. Continuation segments use their
/// 1-based chain position.
pub const DIR_START: Cookie = 0;

/// Opaque object handle minted by the backing filesystem.
///
/// Wrapping [`Bytes`] keeps clones cheap: a lookup-path clone is a refcount
/// bump, not a heap allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ObjectHandle(Bytes);

impl ObjectHandle {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    /// The null handle compares lesser than every non-null handle.
    pub fn null() -> Self {
        Self(Bytes::new())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Node type reported by the backing filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    RegularFile,
    Directory,
    SymbolicLink,
    Socket,
    Fifo,
    BlockDevice,
    CharDevice,
    /// The backend could not classify the object.
    Unknown,
}

/// Object attributes as reported by the backing filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectAttributes {
    pub node_type: NodeType,
    pub size: u64,
    pub space_used: u64,
    pub links: u32,
    pub owner: u32,
    pub group: u32,
    pub mode: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl ObjectAttributes {
    pub fn new(node_type: NodeType, size: u64) -> Self {
        let now = SystemTime::now();
        Self {
            node_type,
            size,
            space_used: size,
            links: 1,
            owner: 0,
            group: 0,
            mode: 0o644,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

/// Credentials and export scope an operation runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpContext {
    pub uid: u32,
    pub gid: u32,
    pub export_id: u16,
}

impl OpContext {
    pub fn root(export_id: u16) -> Self {
        Self {
            uid: 0,
            gid: 0,
            export_id,
        }
    }
}

/// Errors surfaced by a backing filesystem.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsalError {
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    Exists,
    #[error("access denied")]
    Access,
    #[error("operation not permitted")]
    Perm,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("directory not empty")]
    NotEmpty,
    #[error("no space left on backing store")]
    NoSpace,
    #[error("read-only backing store")]
    ReadOnly,
    #[error("stale object handle")]
    Stale,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("security context rejected")]
    Security,
    #[error("invalid argument")]
    Invalid,
    #[error("I/O error")]
    Io,
    #[error("delayed, retry")]
    Delay,
}

/// Backing filesystem operations the metadata cache relies on.
pub trait Fsal: Send + Sync {
    /// Fetch fresh attributes for an object.
    fn get_attributes(
        &self,
        handle: &ObjectHandle,
        ctx: &OpContext,
    ) -> Result<ObjectAttributes, FsalError>;

    /// Truncate a regular file and return its refreshed attributes.
    fn truncate(
        &self,
        handle: &ObjectHandle,
        ctx: &OpContext,
        length: u64,
    ) -> Result<ObjectAttributes, FsalError>;

    /// Release backend-side resources tied to an object that is being
    /// evicted from the cache.
    fn clean_object_resources(&self, _handle: &ObjectHandle) -> Result<(), FsalError> {
        Ok(())
    }
}

/// Token for an object attached to the secondary content cache.
pub type ContentHandle = u64;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContentError {
    #[error("object has no cached content")]
    NotCached,
    #[error("content cache I/O error")]
    Io,
}

/// Optional secondary cache holding file data alongside the metadata cache.
///
/// When a regular file is attached here, truncation is delegated to the
/// content cache instead of the backing filesystem.
pub trait ContentCache: Send + Sync {
    /// Whether content for this handle survives from a previous run.
    fn test_cached(&self, handle: &ObjectHandle) -> bool;

    /// Re-attach surviving content and return its token.
    fn recover(&self, handle: &ObjectHandle) -> Result<ContentHandle, ContentError>;

    /// Size of the cached content, if known.
    fn cached_size(&self, content: ContentHandle) -> Option<u64>;

    fn truncate(&self, content: ContentHandle, length: u64) -> Result<(), ContentError>;

    fn release(&self, content: ContentHandle) -> Result<(), ContentError>;
}
