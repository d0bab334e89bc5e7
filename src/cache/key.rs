//! Cache key codec.
//!
//! Every cached object is addressed by its FSAL handle plus a cookie. The
//! cookie is [`DIR_START`] for everything except directory continuation
//! segments, which use their 1-based chain position so a single directory can
//! occupy several table slots under one handle.
//!
//! Key equality is the comparator the cache table runs on: the cookies must
//! match exactly, two null handles are equal, a null handle never equals a
//! non-null one, and non-null handles compare byte for byte. Backends must
//! mint handles in canonical form for that last rule to hold.

use std::hash::{Hash, Hasher};

use crate::fsal::{Cookie, ObjectHandle, DIR_START};

/// Key addressing one entry in the cache table.
#[derive(Debug, Clone)]
pub struct CacheKey {
    pub handle: ObjectHandle,
    pub cookie: Cookie,
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        if self.cookie != other.cookie {
            return false;
        }
        match (self.handle.is_null(), other.handle.is_null()) {
            (true, true) => true,
            (true, false) | (false, true) => false,
            (false, false) => self.handle.as_bytes() == other.handle.as_bytes(),
        }
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle.as_bytes().hash(state);
        self.cookie.hash(state);
    }
}

impl CacheKey {
    /// Key of a non-continuation object (file, symlink, special node, or
    /// directory head).
    pub fn start(handle: ObjectHandle) -> Self {
        Self {
            handle,
            cookie: DIR_START,
        }
    }

    /// Key of a directory continuation segment at `position` (1-based) in
    /// the chain hanging off `handle`'s head.
    pub fn for_continuation(handle: ObjectHandle, position: u64) -> Self {
        Self {
            handle,
            cookie: position,
        }
    }

    /// Borrowed lookup key. `ObjectHandle` wraps `Bytes`, so this is a
    /// refcount bump rather than a copy of the handle material.
    pub fn borrowed(handle: &ObjectHandle, cookie: Cookie) -> Self {
        Self {
            handle: handle.clone(),
            cookie,
        }
    }

    /// Owned insertion key. Kept as a distinct constructor so insertion
    /// sites read differently from lookup sites.
    pub fn to_owned_key(&self) -> Self {
        self.clone()
    }
}
