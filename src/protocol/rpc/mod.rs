//! ONC RPC version 2 client (RFC 5531).
//!
//! Layers, bottom up:
//!
//! 1. [`Transport`]: moves whole messages over TCP (record marking) or UDP
//! 2. [`Connection`]: multiplexes concurrent calls over one transport by
//!    transaction id, with a listener task per connection
//! 3. [`Credential`]: `AUTH_NULL`, `AUTH_UNIX` or RPCSEC_GSS
//! 4. [`RpcClient`]: call encoding, retransmission and reply decoding
//!
//! Connections are shared process-wide through a [`ConnectionRegistry`].

mod auth;
mod client;
mod connection;
mod gss;
mod transaction_tracker;
mod transport;
mod wire;

pub use auth::Credential;
pub use client::{RpcClient, RpcHandler};
pub use connection::{Connection, ConnectionRegistry, TransportFactory};
pub use gss::{GssCredential, GssMechanism, SecurityContext};
pub use transaction_tracker::TransactionTracker;
pub use transport::{Endpoint, TcpTransport, Transport, TransportKind, UdpTransport};
pub use wire::{read_record, write_fragment};

/// Largest RPC record accepted from the network.
pub const MAX_RPC_RECORD_LENGTH: usize = 8 * 1024 * 1024;
