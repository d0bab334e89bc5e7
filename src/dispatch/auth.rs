//! Request authentication.

use thiserror::Error;

/// Credential material as it arrived on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawCredential {
    None,
    Unix {
        uid: u32,
        gid: u32,
        machine: String,
    },
}

/// Identity a request runs under once authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityContext {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential flavor not supported")]
    UnsupportedFlavor,
    #[error("credential rejected")]
    Rejected,
}

/// Pluggable credential verification.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, cred: &RawCredential) -> Result<SecurityContext, AuthError>;
}

/// Accepts Unix-flavor credentials at face value, the default for trusted
/// networks. Anything else is rejected.
#[derive(Debug, Default)]
pub struct UnixAuthenticator;

impl Authenticator for UnixAuthenticator {
    fn authenticate(&self, cred: &RawCredential) -> Result<SecurityContext, AuthError> {
        match cred {
            RawCredential::Unix { uid, gid, .. } => Ok(SecurityContext {
                uid: *uid,
                gid: *gid,
            }),
            RawCredential::None => Err(AuthError::UnsupportedFlavor),
        }
    }
}
