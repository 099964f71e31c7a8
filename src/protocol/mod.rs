//! Protocol module implements the wire side of the client: data encoding
//! and remote procedure calls.
//!
//! This module contains two main components:
//!
//! - `xdr`: External Data Representation (XDR) for serialization and deserialization
//!   of data structures according to RFC 4506, with the message types of the NFS
//!   version 2 and 3, MOUNT, PORTMAP and RPCSEC_GSS protocols.
//!
//! - `rpc`: Remote Procedure Call (RPC) client as defined in RFC 5531: transports,
//!   connections shared by many concurrent calls, transaction tracking, credentials
//!   and the retry policy.
//!
//! The NFS protocol is a network file system protocol originally designed by Sun Microsystems.
//! It is stateless, using file handles to identify files rather than path names, which lets
//! a client cache aggressively and recover from server restarts by replaying its requests.

pub mod rpc;
pub mod xdr;
