//! Error type shared by the RPC transport, the security layer and the
//! NFS buffer cache.
//!
//! Every failure ultimately reaches the caller of a file operation as an
//! [`Error`]. The type is `Clone` because one failure is often reported to
//! several waiters at once: a dead connection listener fails every pending
//! call, and a failed buffer unload is seen by whoever waits on that buffer.

use std::sync::Arc;

use thiserror::Error;

use crate::xdr::nfs3::nfsstat3;
use crate::xdr::rpc::auth_stat;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// No reply within the retry budget.
    #[error("RPC to {server} timed out after {attempts} attempt(s)")]
    Timeout { server: String, attempts: u32 },

    /// The connection listener died; the connection cannot be used any more.
    #[error("connection to {server} failed: {reason}")]
    ConnectionFailed { server: String, reason: String },

    /// Malformed or truncated data on the wire.
    #[error("XDR decoding error: {0}")]
    Decode(String),

    #[error("RPC protocol error: {0}")]
    Protocol(String),

    /// The server accepted the call but could not execute it.
    #[error("RPC call rejected: {0}")]
    Rejected(String),

    #[error("authentication failed: {0:?}")]
    Auth(auth_stat),

    #[error("GSS-API failure: major {major:#010x}, minor {minor}")]
    Gss { major: u32, minor: u32 },

    #[error("NFS error: {0:?}")]
    Nfs(nfsstat3),

    #[error("invalid NFS URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn decode(err: std::io::Error) -> Self {
        Error::Decode(err.to_string())
    }

    /// True when retrying the same call later might succeed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// True for NFS status codes meaning the object is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Nfs(nfsstat3::NFS3ERR_NOENT) | Error::Nfs(nfsstat3::NFS3ERR_STALE))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<nfsstat3> for Error {
    fn from(stat: nfsstat3) -> Self {
        Error::Nfs(stat)
    }
}
