//! Credentials attached to every call.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::gss::GssCredential;
use crate::error::{Error, Result};
use crate::xdr::rpc::{auth_flavor, auth_stat, auth_unix, opaque_auth};
use crate::xdr::{Serialize, XdrBuffer};

/// How calls are authenticated.
#[derive(Clone, Debug, Default)]
pub enum Credential {
    /// `AUTH_NULL`
    #[default]
    None,
    /// `AUTH_UNIX`: the caller's uid and groups, taken on trust.
    Unix(Arc<auth_unix>),
    /// RPCSEC_GSS, negotiated with the server on first use.
    Gss(Arc<GssCredential>),
}

impl Credential {
    pub fn unix(machine_name: &str, uid: u32, gid: u32, gids: &[u32]) -> Self {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        Credential::Unix(Arc::new(auth_unix {
            stamp,
            machinename: machine_name.as_bytes().to_vec(),
            uid,
            gid,
            gids: gids.iter().copied().take(16).collect(),
        }))
    }

    pub fn flavor(&self) -> auth_flavor {
        match self {
            Credential::None => auth_flavor::AUTH_NULL,
            Credential::Unix(_) => auth_flavor::AUTH_UNIX,
            Credential::Gss(_) => auth_flavor::RPCSEC_GSS,
        }
    }

    /// Writes credential and verifier after the call header in `buf`.
    /// Returns the GSS sequence number of the call, 0 for other flavors.
    pub fn put_cred_verf(&self, buf: &mut XdrBuffer) -> Result<u32> {
        match self {
            Credential::None => {
                buf.encode(&opaque_auth::null())?;
                buf.encode(&opaque_auth::null())?;
                Ok(0)
            }
            Credential::Unix(unix) => {
                let mut body = Vec::new();
                unix.serialize(&mut body)?;
                buf.encode(&opaque_auth { flavor: auth_flavor::AUTH_UNIX, body })?;
                buf.encode(&opaque_auth::null())?;
                Ok(0)
            }
            Credential::Gss(gss) => gss.put_cred_verf(buf),
        }
    }

    /// Protects the arguments encoded after the buffer's wrap offset.
    pub fn wrap(&self, buf: &mut XdrBuffer, seq_num: u32) -> Result<()> {
        match self {
            Credential::Gss(gss) => gss.wrap(buf, seq_num),
            _ => Ok(()),
        }
    }

    /// Strips the protection of the results at the buffer cursor.
    pub fn unwrap(&self, buf: XdrBuffer, seq_num: u32) -> Result<XdrBuffer> {
        match self {
            Credential::Gss(gss) => gss.unwrap(buf, seq_num),
            _ => Ok(buf),
        }
    }

    /// Checks the verifier of an accepted reply.
    pub fn validate(&self, verf: &opaque_auth, seq_num: u32) -> Result<()> {
        match self {
            Credential::Gss(gss) => gss.validate(verf, seq_num),
            _ => Ok(()),
        }
    }

    /// True if a fresh GSS context may fix a call that failed with `err`.
    pub fn is_refreshable(&self, err: &Error) -> bool {
        matches!(
            (self, err),
            (
                Credential::Gss(_),
                Error::Auth(auth_stat::RPCSEC_GSS_CREDPROBLEM | auth_stat::RPCSEC_GSS_CTXPROBLEM)
            )
        )
    }
}
