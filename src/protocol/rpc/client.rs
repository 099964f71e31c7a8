//! Call layer: builds an ONC RPC call, sends it over a shared
//! [`Connection`], applies the retry policy and decodes the reply header.

use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, info, warn};
use tracing_attributes::instrument;

use super::auth::Credential;
use super::connection::Connection;
use super::gss::decode_init_res;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::xdr::gss::rpc_gss_init_res;
use crate::xdr::rpc::{
    accept_body, opaque_auth, rejected_reply, reply_body, rpc_body, rpc_msg, CALL, RPC_VERSION,
};
use crate::xdr::{Serialize, XdrBuffer};

/// Hook told about servers that stop and start answering.
pub trait RpcHandler: Send + Sync {
    /// A call to `server` timed out for the first time.
    fn timeout(&self, server: &str, attempt: u32);

    /// A call that had timed out got its reply after all.
    fn ok(&self, server: &str);
}

/// Calls to one program version on one connection with one credential.
#[derive(Clone)]
pub struct RpcClient {
    connection: Arc<Connection>,
    prog: u32,
    vers: u32,
    cred: Credential,
    timeout: Duration,
    retries: u32,
    max_auth_refresh: u32,
    capacity: usize,
    handler: Option<Arc<dyn RpcHandler>>,
}

impl RpcClient {
    pub fn new(
        connection: Arc<Connection>,
        prog: u32,
        vers: u32,
        cred: Credential,
        config: &ClientConfig,
    ) -> Self {
        Self {
            connection,
            prog,
            vers,
            cred,
            timeout: config.timeout,
            retries: config.retries,
            max_auth_refresh: config.max_auth_refresh,
            capacity: config.message_capacity(),
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn RpcHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration, retries: u32) -> Self {
        self.timeout = timeout;
        self.retries = retries;
        self
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn credential(&self) -> &Credential {
        &self.cred
    }

    pub fn program(&self) -> (u32, u32) {
        (self.prog, self.vers)
    }

    /// Procedure 0 of the program: checks the server is alive.
    pub async fn null(&self) -> Result<()> {
        self.call(0, &()).await.map(|_| ())
    }

    /// Calls `proc` and returns a buffer positioned at its results.
    ///
    /// A GSS credential is negotiated first if needed, and renegotiated
    /// when the server reports a credential or context problem.
    #[instrument(level = "trace", skip(self, args), fields(server = %self.connection.server()))]
    pub async fn call<A>(&self, proc: u32, args: &A) -> Result<XdrBuffer>
    where
        A: Serialize + Sync + ?Sized,
    {
        let mut refreshes = 0;
        loop {
            if let Credential::Gss(gss) = &self.cred {
                gss.establish(self).await?;
            }
            match self.call_once(proc, args).await {
                Err(e) if self.cred.is_refreshable(&e) && refreshes < self.max_auth_refresh => {
                    refreshes += 1;
                    info!("Refreshing GSS context for {}: {}", self.connection.server(), e);
                    if let Credential::Gss(gss) = &self.cred {
                        gss.invalidate();
                    }
                }
                res => return res,
            }
        }
    }

    /// One call with retransmissions, but without credential negotiation.
    pub(crate) async fn call_once<A>(&self, proc: u32, args: &A) -> Result<XdrBuffer>
    where
        A: Serialize + Sync + ?Sized,
    {
        self.exchange(proc, args).await.map(|(results, _)| results)
    }

    /// Sends a GSS context creation token on the NULL procedure.
    pub(crate) async fn gss_init_call(
        &self,
        token: &[u8],
    ) -> Result<(rpc_gss_init_res, opaque_auth)> {
        let (mut results, verf) = self.exchange(0, token).await?;
        Ok((decode_init_res(&mut results)?, verf))
    }

    /// Best-effort teardown of the credential's server-side state.
    pub async fn close(&self) {
        if let Credential::Gss(gss) = &self.cred {
            gss.destroy(self).await;
        }
    }

    async fn exchange<A>(&self, proc: u32, args: &A) -> Result<(XdrBuffer, opaque_auth)>
    where
        A: Serialize + Sync + ?Sized,
    {
        let xid = self.connection.next_xid();
        // Each transmission gets its own GSS sequence number; a late reply
        // to an earlier one must still validate.
        let mut seqs: SmallVec<[u32; 4]> = SmallVec::new();
        let mut attempt = 0;
        let mut timed_out = false;
        loop {
            attempt += 1;
            let (message, seq) = self.encode_call(xid, proc, args)?;
            seqs.push(seq);

            match self.connection.send(xid, &message, self.timeout).await {
                Ok(reply) => {
                    if timed_out {
                        info!("Server {} OK", self.connection.server());
                        if let Some(handler) = &self.handler {
                            handler.ok(self.connection.server());
                        }
                    }
                    return self.decode_reply(xid, reply, &seqs);
                }
                Err(e) if e.is_timeout() || matches!(e, Error::Io(_)) => {
                    if !timed_out {
                        timed_out = true;
                        warn!("Server {} not responding, still trying", self.connection.server());
                        if let Some(handler) = &self.handler {
                            handler.timeout(self.connection.server(), attempt);
                        }
                    }
                    if self.retries != 0 && attempt >= self.retries {
                        return Err(Error::Timeout {
                            server: self.connection.server().to_string(),
                            attempts: attempt,
                        });
                    }
                    if let Error::Io(_) = e {
                        // The reply wait did not happen; pace the retries.
                        tokio::time::sleep(self.timeout).await;
                    }
                    debug!("Retransmitting xid {} (attempt {})", xid, attempt + 1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn encode_call<A>(&self, xid: u32, proc: u32, args: &A) -> Result<(Vec<u8>, u32)>
    where
        A: Serialize + ?Sized,
    {
        let mut buf = XdrBuffer::new(self.capacity);
        buf.put_uint(xid)?;
        buf.put_uint(CALL)?;
        buf.put_uint(RPC_VERSION)?;
        buf.put_uint(self.prog)?;
        buf.put_uint(self.vers)?;
        buf.put_uint(proc)?;
        let seq = self.cred.put_cred_verf(&mut buf)?;
        buf.set_wrap_offset(buf.offset());
        buf.encode(args)?;
        self.cred.wrap(&mut buf, seq)?;
        Ok((buf.into_encoded(), seq))
    }

    fn decode_reply(
        &self,
        xid: u32,
        reply: Vec<u8>,
        seqs: &[u32],
    ) -> Result<(XdrBuffer, opaque_auth)> {
        let mut buf = XdrBuffer::from_received(reply);
        let msg: rpc_msg = buf.decode()?;
        if msg.xid != xid {
            return Err(Error::Protocol(format!(
                "reply xid {} does not match call {}",
                msg.xid, xid
            )));
        }
        let accepted = match msg.body {
            rpc_body::REPLY(reply_body::MSG_ACCEPTED(accepted)) => accepted,
            rpc_body::REPLY(reply_body::MSG_DENIED(rejected_reply::AUTH_ERROR(stat))) => {
                return Err(Error::Auth(stat));
            }
            rpc_body::REPLY(reply_body::MSG_DENIED(rejected_reply::RPC_MISMATCH(info))) => {
                return Err(Error::Rejected(format!(
                    "RPC version {} not supported, server accepts {}-{}",
                    RPC_VERSION, info.low, info.high
                )));
            }
            rpc_body::CALL(_) => {
                return Err(Error::Protocol(String::from("received a call instead of a reply")));
            }
        };

        match accepted.reply_data {
            accept_body::SUCCESS => {}
            accept_body::PROG_UNAVAIL => {
                return Err(Error::Rejected(format!("program {} unavailable", self.prog)));
            }
            accept_body::PROG_MISMATCH(info) => {
                return Err(Error::Rejected(format!(
                    "program {} version {} unavailable, server has {}-{}",
                    self.prog, self.vers, info.low, info.high
                )));
            }
            accept_body::PROC_UNAVAIL => {
                return Err(Error::Rejected(format!(
                    "procedure unavailable in program {}",
                    self.prog
                )));
            }
            accept_body::GARBAGE_ARGS => {
                return Err(Error::Rejected(String::from("server could not decode arguments")));
            }
            accept_body::SYSTEM_ERR => {
                return Err(Error::Rejected(String::from("server system error")));
            }
        }

        let mut last_err = None;
        for &seq in seqs.iter().rev() {
            match self.cred.validate(&accepted.verf, seq) {
                Ok(()) => return Ok((self.cred.unwrap(buf, seq)?, accepted.verf)),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Protocol(String::from("reply to a call never sent"))))
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("server", &self.connection.server())
            .field("prog", &self.prog)
            .field("vers", &self.vers)
            .field("cred", &self.cred.flavor())
            .finish()
    }
}
