//! RPCSEC_GSS wire structures (RFC 2203 section 5).
//!
//! An RPCSEC_GSS credential carries a control procedure telling the server
//! whether this call creates, continues, uses or destroys a security
//! context. Context creation rides on the NULL procedure of the target
//! program: the argument is a GSS token and the result an
//! [`rpc_gss_init_res`].

#![allow(dead_code)]
#![allow(non_camel_case_types)]

use std::io::{Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};

use super::*;

pub const RPCSEC_GSS_VERS_1: u32 = 1;

/// Largest sequence number a client may use before it must create a new
/// context (RFC 2203 section 5.3.3.1).
pub const MAXSEQ: u32 = 0x8000_0000;

/// GSS-API major status codes seen in [`rpc_gss_init_res`].
pub const GSS_S_COMPLETE: u32 = 0;
pub const GSS_S_CONTINUE_NEEDED: u32 = 1;
/// No credentials were supplied, or they are unavailable.
pub const GSS_S_NO_CRED: u32 = 7 << 16;
/// Unspecified failure.
pub const GSS_S_FAILURE: u32 = 13 << 16;

/// Control procedure of a call.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum rpc_gss_proc_t {
    /// Normal call under an established context
    #[default]
    RPCSEC_GSS_DATA = 0,
    /// First token of a context negotiation
    RPCSEC_GSS_INIT = 1,
    /// Subsequent tokens of a context negotiation
    RPCSEC_GSS_CONTINUE_INIT = 2,
    /// Tear the context down
    RPCSEC_GSS_DESTROY = 3,
}
SerializeEnum!(rpc_gss_proc_t);
DeserializeEnum!(rpc_gss_proc_t);

/// Protection applied to call arguments and results.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum rpc_gss_service_t {
    /// Header authentication only
    #[default]
    rpc_gss_svc_none = 1,
    /// Arguments and results carry a checksum
    rpc_gss_svc_integrity = 2,
    /// Arguments and results are encrypted
    rpc_gss_svc_privacy = 3,
}
SerializeEnum!(rpc_gss_service_t);
DeserializeEnum!(rpc_gss_service_t);

/// Version 1 credential body, preceded on the wire by the version number.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct rpc_gss_cred_t {
    pub version: u32,
    pub gss_proc: rpc_gss_proc_t,
    pub seq_num: u32,
    pub service: rpc_gss_service_t,
    /// Empty until the server hands one out in its init reply
    pub handle: Vec<u8>,
}
DeserializeStruct!(rpc_gss_cred_t, version, gss_proc, seq_num, service, handle);
SerializeStruct!(rpc_gss_cred_t, version, gss_proc, seq_num, service, handle);

/// Server reply to an INIT or CONTINUE_INIT call.
#[derive(Clone, Debug, Default)]
pub struct rpc_gss_init_res {
    pub handle: Vec<u8>,
    pub gss_major: u32,
    pub gss_minor: u32,
    /// Size of the window of sequence numbers the server will accept
    pub seq_window: u32,
    pub gss_token: Vec<u8>,
}
DeserializeStruct!(rpc_gss_init_res, handle, gss_major, gss_minor, seq_window, gss_token);
SerializeStruct!(rpc_gss_init_res, handle, gss_major, gss_minor, seq_window, gss_token);

/// Body of an integrity-protected argument or result: the XDR encoding of
/// `seq_num` followed by the procedure data, and a MIC over it.
#[derive(Clone, Debug, Default)]
pub struct rpc_gss_integ_data {
    pub databody_integ: Vec<u8>,
    pub checksum: Vec<u8>,
}
DeserializeStruct!(rpc_gss_integ_data, databody_integ, checksum);
SerializeStruct!(rpc_gss_integ_data, databody_integ, checksum);

/// Body of a privacy-protected argument or result: the wrapped encoding of
/// `seq_num` followed by the procedure data.
#[derive(Clone, Debug, Default)]
pub struct rpc_gss_priv_data {
    pub databody_priv: Vec<u8>,
}
DeserializeStruct!(rpc_gss_priv_data, databody_priv);
SerializeStruct!(rpc_gss_priv_data, databody_priv);
