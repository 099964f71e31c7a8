//! NFS Mamont Client - an NFS version 3 client with a block cache, in Rust
//!
//! This library reads and writes files on NFS servers the way a kernel
//! client would: file data moves through block-sized buffers that are
//! loaded ahead of sequential readers, written behind writers and
//! committed in batches, while attributes are cached for a window that
//! adapts to how often the file changes.
//!
//! ## Main Components
//!
//! - `protocol`: XDR encoding and ONC RPC. Calls to any number of servers
//!   are multiplexed by transaction id over shared TCP or UDP connections,
//!   with retransmission, timeouts and AUTH_NONE, AUTH_UNIX or RPCSEC_GSS
//!   credentials.
//!
//! - `nfs`: the file API. [`NfsClient`] resolves `nfs://` URLs through the
//!   WebNFS public handle or the MOUNT protocol, and [`NfsFile`] gives
//!   cached, asynchronous access to one file or directory.
//!
//! - `config`: the tuning knobs shared by all of the above.
//!
//! ## Standards Compliance
//!
//! This implementation follows these RFCs:
//! - RFC 1813: NFS Version 3 Protocol Specification
//! - RFC 1094: NFS Version 2 (attribute records only)
//! - RFC 2054/2055: WebNFS public file handle
//! - RFC 5531: RPC: Remote Procedure Call Protocol Specification Version 2
//! - RFC 4506: XDR: External Data Representation Standard
//! - RFC 1833: Binding Protocols for ONC RPC Version 2
//! - RFC 2203: RPCSEC_GSS Protocol Specification
//!
//! ## Usage
//!
//! Build an [`NfsClient`] from a [`ClientConfig`], `open` a URL and use
//! `read`, `write`, `flush` and `close` on the returned [`NfsFile`].

pub mod config;
pub mod error;
pub mod nfs;
pub mod protocol;
pub mod url;

pub use config::ClientConfig;
pub use error::{Error, Result};
pub use nfs::{NfsClient, NfsFile};
pub use protocol::xdr;
pub use url::NfsUrl;
