//! Request dispatch: worker pool, duplicate-request cache, protocol
//! handlers, exports, and authentication.
//!
//! Transport decode/encode is outside this crate's scope; requests arrive
//! pre-decoded as [`Request`] and replies leave as opaque encoded byte
//! buffers through the [`Transport`] a request carries with it.

pub mod auth;
pub mod dupreq;
pub mod export;
pub mod handlers;
pub mod worker;

use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use thiserror::Error;

pub use auth::{AuthError, Authenticator, RawCredential, SecurityContext, UnixAuthenticator};
pub use dupreq::DupReqCache;
pub use export::{Export, ExportTable};
pub use handlers::{HandlerTable, ProcDesc, RequestContext};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerStats};

use crate::cache::CacheError;
use crate::fsal::{ObjectAttributes, ObjectHandle};

bitflags! {
    /// Dispatch-relevant properties of a procedure.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DispatchFlags: u32 {
        /// The procedure needs an authenticated security context.
        const NEEDS_CRED = 1 << 0;
        /// The procedure mutates backend state; rejected on read-only
        /// exports before the handler runs.
        const MAKES_WRITE = 1 << 1;
        /// Replies are worth storing for duplicate-request replay.
        const CAN_BE_DUP = 1 << 2;
    }
}

impl DispatchFlags {
    pub const NOTHING_SPECIAL: Self = Self::empty();
}

/// How a processed request should be concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqStatus {
    /// Reply normally.
    Ok,
    /// Say nothing; the client will retransmit. Used for transient
    /// failures where an error reply would make the client give up.
    Drop,
    /// The handler failed in a way worth answering; reply with the error.
    Failed,
}

/// Protocol-level status codes carried in replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoStatus {
    Ok,
    NotFound,
    Io,
    Access,
    Exists,
    NotDir,
    IsDir,
    Invalid,
    NoSpace,
    ReadOnlyFs,
    NotEmpty,
    Quota,
    Stale,
    ServerFault,
}

impl ProtoStatus {
    pub fn code(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::Io => 5,
            Self::NotFound => 2,
            Self::Access => 13,
            Self::Exists => 17,
            Self::NotDir => 20,
            Self::IsDir => 21,
            Self::Invalid => 22,
            Self::NoSpace => 28,
            Self::ReadOnlyFs => 30,
            Self::NotEmpty => 66,
            Self::Quota => 69,
            Self::Stale => 70,
            Self::ServerFault => 10006,
        }
    }

    /// Protocol status a cache error is answered with.
    pub fn from_cache_error(err: &CacheError) -> Self {
        match err {
            CacheError::NotFound => Self::NotFound,
            CacheError::BadType | CacheError::InvalidArgument => Self::Invalid,
            CacheError::Exists => Self::Exists,
            CacheError::NotADirectory => Self::NotDir,
            CacheError::IsADirectory => Self::IsDir,
            CacheError::DirNotEmpty => Self::NotEmpty,
            CacheError::StaleHandle => Self::Stale,
            CacheError::Access | CacheError::Security => Self::Access,
            CacheError::NoSpace => Self::NoSpace,
            CacheError::Quota => Self::Quota,
            CacheError::ReadOnlyFs => Self::ReadOnlyFs,
            CacheError::Io => Self::Io,
            CacheError::Delay
            | CacheError::Allocation(_)
            | CacheError::Lru(_)
            | CacheError::Content(_)
            | CacheError::InconsistentType
            | CacheError::InconsistentEntry => Self::ServerFault,
        }
    }
}

/// Decoded result a handler produces; encoded once, stored verbatim for
/// duplicate replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcResult {
    Void,
    Attrs(ObjectAttributes),
    Error(ProtoStatus),
}

/// Encode a handler result into the reply body. Stands in for the wire
/// serializer, which is out of scope; what matters here is that the
/// encoding is deterministic so replayed replies are byte-identical.
pub fn encode_result(result: &ProcResult) -> Bytes {
    let text = match result {
        ProcResult::Void => "0 void".to_string(),
        ProcResult::Attrs(attrs) => format!(
            "0 attrs type={:?} size={} used={} links={} owner={} group={} mode={:o}",
            attrs.node_type,
            attrs.size,
            attrs.space_used,
            attrs.links,
            attrs.owner,
            attrs.group,
            attrs.mode,
        ),
        ProcResult::Error(status) => format!("{} error", status.code()),
    };
    Bytes::from(text.into_bytes())
}

/// Decoded procedure arguments.
#[derive(Debug, Clone)]
pub enum ProcArgs {
    Null,
    GetAttr {
        handle: ObjectHandle,
    },
    SetAttr {
        handle: ObjectHandle,
        new_size: Option<u64>,
    },
    Rename {
        src_dir: ObjectHandle,
        src_name: String,
        dst_dir: ObjectHandle,
        dst_name: String,
    },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("transport send failed")]
pub struct TransportError;

/// Protocol-layer rejections sent without running a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    AuthFailed,
    GarbageArgs,
    ProcedureUnavailable,
}

/// Reply channel a request arrived on.
pub trait Transport: Send + Sync {
    fn send_reply(&self, xid: u32, body: &Bytes) -> Result<(), TransportError>;
    fn send_error(&self, xid: u32, kind: RpcErrorKind) -> Result<(), TransportError>;
}

/// One decoded request, ready for a worker.
#[derive(Clone)]
pub struct Request {
    pub xid: u32,
    pub proc_id: usize,
    pub export_id: u16,
    pub args: ProcArgs,
    pub cred: RawCredential,
    /// Client machine name, used by export allow-lists.
    pub client_host: String,
    pub transport: Arc<dyn Transport>,
}
