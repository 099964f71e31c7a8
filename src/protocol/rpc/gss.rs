//! RPCSEC_GSS credentials (RFC 2203).
//!
//! A [`GssCredential`] negotiates a security context with the server through
//! a token exchange carried by NULL calls, then authenticates every call
//! with a MIC over its header and optionally protects arguments and results
//! (integrity or privacy service).
//!
//! The GSS-API mechanism itself (Kerberos V5 in practice) is not part of
//! this crate; it is plugged in through [`GssMechanism`] and
//! [`SecurityContext`].

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};
use tracing_attributes::instrument;

use super::client::RpcClient;
use crate::error::{Error, Result};
use crate::xdr::gss::{
    rpc_gss_cred_t, rpc_gss_init_res, rpc_gss_integ_data, rpc_gss_priv_data, rpc_gss_proc_t,
    rpc_gss_service_t, GSS_S_COMPLETE, GSS_S_CONTINUE_NEEDED, GSS_S_FAILURE, GSS_S_NO_CRED,
    MAXSEQ, RPCSEC_GSS_VERS_1,
};
use crate::xdr::rpc::{auth_flavor, auth_stat, opaque_auth};
use crate::xdr::{Serialize, XdrBuffer};

/// Fresh contexts allowed after a credential failure during the handshake.
const INIT_RETRIES: u32 = 1;

/// One GSS-API security context in the making or established.
///
/// Failures are reported as [`Error::Gss`] with the GSS major and minor
/// status.
pub trait SecurityContext: Send {
    /// Processes the last token received from the server (empty at first)
    /// and produces the next token to send, if any.
    fn init_sec_context(&mut self, input: &[u8]) -> Result<Option<Vec<u8>>>;

    fn is_established(&self) -> bool;

    /// Computes a message integrity code over `message`.
    fn get_mic(&self, message: &[u8]) -> Result<Vec<u8>>;

    fn verify_mic(&self, message: &[u8], mic: &[u8]) -> Result<()>;

    /// Encrypts and integrity-protects `message`.
    fn wrap(&self, message: &[u8]) -> Result<Vec<u8>>;

    fn unwrap(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// Factory of security contexts for one target service.
pub trait GssMechanism: Send + Sync {
    /// A new, unestablished context for `service` (e.g. `nfs@server`).
    fn new_context(&self, service: &str) -> Result<Box<dyn SecurityContext>>;
}

struct GssState {
    gss_proc: rpc_gss_proc_t,
    handle: Vec<u8>,
    seq_num: u32,
    seq_window: u32,
    context: Option<Box<dyn SecurityContext>>,
}

impl GssState {
    fn established(&self) -> bool {
        self.gss_proc == rpc_gss_proc_t::RPCSEC_GSS_DATA && self.context.is_some()
    }

    fn context(&self) -> Result<&dyn SecurityContext> {
        self.context.as_deref().ok_or(Error::Auth(auth_stat::RPCSEC_GSS_CTXPROBLEM))
    }
}

pub struct GssCredential {
    mechanism: Box<dyn GssMechanism>,
    target: String,
    service: rpc_gss_service_t,
    state: Mutex<GssState>,
    /// Serializes handshakes; data calls wait on it while one runs.
    handshake: tokio::sync::Mutex<()>,
}

impl GssCredential {
    /// A credential for `target` (`service@host`), not yet negotiated.
    pub fn new(
        mechanism: Box<dyn GssMechanism>,
        target: impl Into<String>,
        service: rpc_gss_service_t,
    ) -> Self {
        Self {
            mechanism,
            target: target.into(),
            service,
            state: Mutex::new(GssState {
                gss_proc: rpc_gss_proc_t::RPCSEC_GSS_INIT,
                handle: Vec::new(),
                seq_num: 0,
                seq_window: 0,
                context: None,
            }),
            handshake: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, GssState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn service(&self) -> rpc_gss_service_t {
        self.service
    }

    /// Current control procedure.
    pub fn gss_proc(&self) -> rpc_gss_proc_t {
        self.state().gss_proc
    }

    /// Context handle assigned by the server; empty before the handshake.
    pub fn handle(&self) -> Vec<u8> {
        self.state().handle.clone()
    }

    pub fn seq_window(&self) -> u32 {
        self.state().seq_window
    }

    pub fn is_established(&self) -> bool {
        self.state().established()
    }

    /// Forgets the context so that the next call negotiates a new one.
    pub fn invalidate(&self) {
        let mut state = self.state();
        state.gss_proc = rpc_gss_proc_t::RPCSEC_GSS_INIT;
        state.handle.clear();
        state.seq_num = 0;
        state.context = None;
    }

    /// Negotiates a context unless one is already established.
    pub(crate) async fn establish(&self, rpc: &RpcClient) -> Result<()> {
        if self.is_established() {
            return Ok(());
        }
        let _handshake = self.handshake.lock().await;
        if self.is_established() {
            return Ok(());
        }

        let mut retries = 0;
        loop {
            match self.negotiate(rpc).await {
                Ok(()) => return Ok(()),
                Err(Error::Gss { major, minor })
                    if (major == GSS_S_NO_CRED || major == GSS_S_FAILURE)
                        && retries < INIT_RETRIES =>
                {
                    retries += 1;
                    warn!(
                        "GSS context setup for {} failed (major {:#x}, minor {}), retrying",
                        self.target, major, minor
                    );
                    self.invalidate();
                }
                Err(e) => {
                    self.invalidate();
                    return Err(e);
                }
            }
        }
    }

    /// Runs one token exchange with a fresh context.
    #[instrument(skip(self, rpc), fields(target = %self.target))]
    async fn negotiate(&self, rpc: &RpcClient) -> Result<()> {
        let mut context = self.mechanism.new_context(&self.target)?;
        {
            let mut state = self.state();
            state.gss_proc = rpc_gss_proc_t::RPCSEC_GSS_INIT;
            state.handle.clear();
            state.seq_num = 0;
        }

        let mut input = Vec::new();
        loop {
            let token = context.init_sec_context(&input)?.filter(|t| !t.is_empty());
            let Some(token) = token else {
                if context.is_established() {
                    break;
                }
                return Err(Error::Protocol(String::from(
                    "GSS context produced no token but is not established",
                )));
            };

            let (res, verf) = rpc.gss_init_call(&token).await?;
            if res.gss_major != GSS_S_COMPLETE && res.gss_major != GSS_S_CONTINUE_NEEDED {
                return Err(Error::Gss { major: res.gss_major, minor: res.gss_minor });
            }
            {
                let mut state = self.state();
                state.handle = res.handle;
                state.seq_window = res.seq_window;
                state.gss_proc = rpc_gss_proc_t::RPCSEC_GSS_CONTINUE_INIT;
            }

            if res.gss_token.is_empty() {
                if res.gss_major == GSS_S_CONTINUE_NEEDED {
                    return Err(Error::Protocol(String::from(
                        "server expects another GSS token but sent none",
                    )));
                }
                if !context.is_established() {
                    return Err(Error::Protocol(String::from(
                        "server completed the GSS handshake before the client context",
                    )));
                }
                // A complete reply carries a MIC of the sequence window.
                if verf.flavor == auth_flavor::RPCSEC_GSS {
                    context.verify_mic(&res.seq_window.to_be_bytes(), &verf.body)?;
                }
                break;
            }
            input = res.gss_token;
        }

        let mut state = self.state();
        if state.handle.is_empty() {
            return Err(Error::Protocol(String::from("server assigned no GSS context handle")));
        }
        state.context = Some(context);
        state.gss_proc = rpc_gss_proc_t::RPCSEC_GSS_DATA;
        debug!("GSS context established, window {}", state.seq_window);
        Ok(())
    }

    /// Sends a best-effort RPCSEC_GSS_DESTROY; failures are ignored since
    /// servers must cope with clients that vanish.
    pub(crate) async fn destroy(&self, rpc: &RpcClient) {
        if !self.is_established() {
            return;
        }
        self.state().gss_proc = rpc_gss_proc_t::RPCSEC_GSS_DESTROY;
        if let Err(e) = rpc.call_once(0, &()).await {
            debug!("Ignoring GSS context destroy failure: {}", e);
        }
        self.invalidate();
    }

    /// Writes the credential and verifier of a call whose header (xid up
    /// to the credential) is already in `buf`. Returns the sequence number
    /// used.
    pub(crate) fn put_cred_verf(&self, buf: &mut XdrBuffer) -> Result<u32> {
        let mut state = self.state();
        let gss_proc = state.gss_proc;
        let seq_num = match gss_proc {
            rpc_gss_proc_t::RPCSEC_GSS_DATA | rpc_gss_proc_t::RPCSEC_GSS_DESTROY => {
                if state.seq_num >= MAXSEQ {
                    return Err(Error::Auth(auth_stat::RPCSEC_GSS_CTXPROBLEM));
                }
                state.seq_num += 1;
                state.seq_num
            }
            _ => 0,
        };
        let cred = rpc_gss_cred_t {
            version: RPCSEC_GSS_VERS_1,
            gss_proc,
            seq_num,
            service: self.service,
            handle: state.handle.clone(),
        };
        let mut body = Vec::new();
        cred.serialize(&mut body)?;
        buf.encode(&opaque_auth { flavor: auth_flavor::RPCSEC_GSS, body })?;

        match gss_proc {
            rpc_gss_proc_t::RPCSEC_GSS_INIT | rpc_gss_proc_t::RPCSEC_GSS_CONTINUE_INIT => {
                buf.encode(&opaque_auth::null())?;
            }
            _ => {
                let mic = state.context()?.get_mic(buf.encoded())?;
                buf.encode(&opaque_auth { flavor: auth_flavor::RPCSEC_GSS, body: mic })?;
            }
        }
        Ok(seq_num)
    }

    /// Protects the procedure arguments between the wrap offset and the
    /// cursor according to the service.
    pub(crate) fn wrap(&self, buf: &mut XdrBuffer, seq_num: u32) -> Result<()> {
        let state = self.state();
        if state.gss_proc != rpc_gss_proc_t::RPCSEC_GSS_DATA
            || self.service == rpc_gss_service_t::rpc_gss_svc_none
        {
            return Ok(());
        }
        let start = buf.wrap_offset();
        let mut databody = Vec::with_capacity(4 + buf.offset() - start);
        databody.extend_from_slice(&seq_num.to_be_bytes());
        databody.extend_from_slice(buf.slice(start, buf.offset()));

        let context = state.context()?;
        buf.rewind_to(start);
        match self.service {
            rpc_gss_service_t::rpc_gss_svc_integrity => {
                let checksum = context.get_mic(&databody)?;
                buf.encode(&rpc_gss_integ_data { databody_integ: databody, checksum })?;
            }
            rpc_gss_service_t::rpc_gss_svc_privacy => {
                let databody_priv = context.wrap(&databody)?;
                buf.encode(&rpc_gss_priv_data { databody_priv })?;
            }
            rpc_gss_service_t::rpc_gss_svc_none => {}
        }
        Ok(())
    }

    /// Checks and strips the protection of the results in `buf`, returning
    /// a buffer holding just the procedure results.
    pub(crate) fn unwrap(&self, mut buf: XdrBuffer, seq_num: u32) -> Result<XdrBuffer> {
        let state = self.state();
        if state.gss_proc != rpc_gss_proc_t::RPCSEC_GSS_DATA
            || self.service == rpc_gss_service_t::rpc_gss_svc_none
        {
            return Ok(buf);
        }
        let context = state.context()?;
        let databody = match self.service {
            rpc_gss_service_t::rpc_gss_svc_integrity => {
                let data: rpc_gss_integ_data = buf.decode()?;
                context.verify_mic(&data.databody_integ, &data.checksum)?;
                data.databody_integ
            }
            rpc_gss_service_t::rpc_gss_svc_privacy => {
                let data: rpc_gss_priv_data = buf.decode()?;
                context.unwrap(&data.databody_priv)?
            }
            rpc_gss_service_t::rpc_gss_svc_none => return Ok(buf),
        };
        let Some(seq) = databody.get(..4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        else {
            return Err(Error::Decode(String::from(
                "protected results shorter than a sequence number",
            )));
        };
        if seq > seq_num || seq < seq_num.saturating_sub(state.seq_window) {
            return Err(Error::Protocol(format!(
                "sequence number {seq} outside window [{}, {seq_num}]",
                seq_num.saturating_sub(state.seq_window)
            )));
        }
        Ok(XdrBuffer::from_received(databody[4..].to_vec()))
    }

    /// Authenticates a reply header: the verifier must be a MIC of the
    /// call's sequence number.
    pub(crate) fn validate(&self, verf: &opaque_auth, seq_num: u32) -> Result<()> {
        let state = self.state();
        if state.gss_proc != rpc_gss_proc_t::RPCSEC_GSS_DATA {
            return Ok(());
        }
        if verf.flavor != auth_flavor::RPCSEC_GSS {
            return Err(Error::Auth(auth_stat::AUTH_INVALIDRESP));
        }
        state.context()?.verify_mic(&seq_num.to_be_bytes(), &verf.body)
    }
}

impl std::fmt::Debug for GssCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("GssCredential")
            .field("target", &self.target)
            .field("service", &self.service)
            .field("gss_proc", &state.gss_proc)
            .field("seq_num", &state.seq_num)
            .finish()
    }
}

/// Reads an `rpc_gss_init_res` from the results of an init call.
pub(crate) fn decode_init_res(buf: &mut XdrBuffer) -> Result<rpc_gss_init_res> {
    buf.decode()
}
