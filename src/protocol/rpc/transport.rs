//! Byte transports underneath a [`Connection`](super::Connection).
//!
//! A transport moves whole RPC messages: one record on a stream socket, one
//! datagram on UDP. Sockets are opened lazily by the first `send` and can be
//! dropped at any time with `disconnect`; the next `send` reopens them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::rpc::{wire, MAX_RPC_RECORD_LENGTH};

/// Socket type of a connection.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransportKind {
    #[default]
    Tcp,
    Udp,
}

impl TransportKind {
    /// The other kind, tried when this one cannot reach the server.
    pub fn fallback(self) -> Self {
        match self {
            TransportKind::Tcp => TransportKind::Udp,
            TransportKind::Udp => TransportKind::Tcp,
        }
    }

    /// Protocol number used by the portmapper.
    pub fn ipproto(self) -> u32 {
        match self {
            TransportKind::Tcp => crate::xdr::portmap::IPPROTO_TCP,
            TransportKind::Udp => crate::xdr::portmap::IPPROTO_UDP,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Udp => f.write_str("udp"),
        }
    }
}

/// Identity of a connection: where it goes and over what.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub kind: TransportKind,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, kind: TransportKind) -> Self {
        Self { host: host.into(), port, kind }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.kind)
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one complete RPC message, opening the socket if needed.
    async fn send(&self, message: &[u8]) -> Result<()>;

    /// Receives one complete RPC message.
    ///
    /// Fails when the transport is not connected. An
    /// [`Error::ConnectionFailed`] means the transport is unusable for good.
    async fn recv(&self) -> Result<Vec<u8>>;

    /// Closes the socket. Pending receives fail; the next send reconnects.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn endpoint(&self) -> &Endpoint;
}

fn not_connected(endpoint: &Endpoint) -> Error {
    Error::from(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        format!("{endpoint} is not connected"),
    ))
}

/// RPC over TCP with record marking.
pub struct TcpTransport {
    endpoint: Endpoint,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
}

impl TcpTransport {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, message: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            let stream = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port))
                .await
                .map_err(|e| Error::ConnectionFailed {
                    server: self.endpoint.to_string(),
                    reason: e.to_string(),
                })?;
            let _ = stream.set_nodelay(true);
            let (read_half, write_half) = stream.into_split();
            debug!("Connected to {}", self.endpoint);
            *self.reader.lock().await = Some(read_half);
            *writer = Some(write_half);
            self.connected.store(true, Ordering::Release);
        }

        let Some(socket) = writer.as_mut() else {
            return Err(not_connected(&self.endpoint));
        };
        if let Err(e) = wire::write_fragment(socket, message).await {
            // A broken stream is reopened by the next send.
            *writer = None;
            self.connected.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        let Some(socket) = reader.as_mut() else {
            return Err(not_connected(&self.endpoint));
        };
        wire::read_record(socket).await
    }

    async fn disconnect(&self) {
        let mut writer = self.writer.lock().await;
        *writer = None;
        *self.reader.lock().await = None;
        self.connected.store(false, Ordering::Release);
        debug!("Disconnected from {}", self.endpoint);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// RPC over UDP: one message per datagram.
pub struct UdpTransport {
    endpoint: Endpoint,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    connected: AtomicBool,
}

impl UdpTransport {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint, socket: Mutex::new(None), connected: AtomicBool::new(false) }
    }

    async fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().await.clone()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, message: &[u8]) -> Result<()> {
        let socket = {
            let mut guard = self.socket.lock().await;
            match guard.as_ref() {
                Some(socket) => socket.clone(),
                None => {
                    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
                    socket
                        .connect((self.endpoint.host.as_str(), self.endpoint.port))
                        .await
                        .map_err(|e| Error::ConnectionFailed {
                            server: self.endpoint.to_string(),
                            reason: e.to_string(),
                        })?;
                    let socket = Arc::new(socket);
                    *guard = Some(socket.clone());
                    self.connected.store(true, Ordering::Release);
                    socket
                }
            }
        };
        socket.send(message).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let Some(socket) = self.socket().await else {
            return Err(not_connected(&self.endpoint));
        };
        let mut datagram = vec![0; MAX_RPC_RECORD_LENGTH.min(u16::MAX as usize)];
        let len = socket.recv(&mut datagram).await?;
        datagram.truncate(len);
        Ok(datagram)
    }

    async fn disconnect(&self) {
        *self.socket.lock().await = None;
        self.connected.store(false, Ordering::Release);
        debug!("Closed datagram socket to {}", self.endpoint);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}
