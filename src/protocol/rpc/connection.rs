//! Multiplexing of concurrent RPC calls over one transport.
//!
//! Every [`Connection`] runs one listener task. The listener receives
//! messages, reads the leading xid and hands the message to the caller
//! registered for that xid in the [`TransactionTracker`]. Callers send their
//! request, then wait on their own receiver with a deadline.
//!
//! Idle policy: when no message arrives within the idle timeout and no
//! caller is waiting, the listener drops the socket and suspends itself.
//! The next caller reconnects by sending and resumes the listener.
//!
//! If the listener dies (a panic in the receive path, or a transport error
//! reported as [`Error::ConnectionFailed`]) the failure is broadcast to all
//! waiters and to every later caller; the connection is unusable from then
//! on and the [`ConnectionRegistry`] replaces it on the next lookup.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::transport::{Endpoint, TcpTransport, Transport, TransportKind, UdpTransport};
use super::TransactionTracker;
use crate::error::{Error, Result};

/// State shared between callers and the listener task.
struct Shared {
    tracker: TransactionTracker,
    /// Wakes a suspended listener.
    resume: Notify,
    /// Held for reading while a caller registers and sends, and for writing
    /// while the listener decides to go idle.
    gate: RwLock<()>,
}

pub struct Connection {
    server: String,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    next_xid: AtomicU32,
    listener: JoinHandle<()>,
}

impl Connection {
    /// Wraps `transport` and starts its listener.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, idle_timeout: Duration) -> Arc<Self> {
        let server = transport.endpoint().to_string();
        let shared = Arc::new(Shared {
            tracker: TransactionTracker::new(),
            resume: Notify::new(),
            gate: RwLock::new(()),
        });
        let listener = tokio::spawn(run_listener(
            server.clone(),
            transport.clone(),
            shared.clone(),
            idle_timeout,
        ));
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() ^ (d.as_secs() as u32))
            .unwrap_or_default();

        Arc::new(Self { server, transport, shared, next_xid: AtomicU32::new(seed), listener })
    }

    /// Server description used in logs and errors.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.transport.endpoint()
    }

    /// Allocates a transaction id for a new call. Retransmissions of the
    /// same call reuse it.
    pub fn next_xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    /// The fatal listener failure, if any.
    pub fn failure(&self) -> Option<Error> {
        self.shared.tracker.failure()
    }

    pub fn is_failed(&self) -> bool {
        self.failure().is_some()
    }

    /// Number of calls waiting for a reply.
    pub fn waiting(&self) -> usize {
        self.shared.tracker.waiting()
    }

    pub fn is_waiting(&self, xid: u32) -> bool {
        self.shared.tracker.is_waiting(xid)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Sends one attempt of call `xid` and waits up to `timeout` for the
    /// reply with the same xid.
    ///
    /// The deadline also covers the send, which for TCP may have to connect
    /// first. On timeout the caller is no longer registered, so a late reply
    /// is dropped by the listener.
    pub async fn send(&self, xid: u32, message: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let receiver = {
            let _gate = self.shared.gate.read().await;
            let receiver = self.shared.tracker.register(xid)?;
            match tokio::time::timeout_at(deadline, self.transport.send(message)).await {
                Ok(Ok(())) => receiver,
                Ok(Err(e)) => {
                    self.shared.tracker.cancel(xid);
                    return Err(e);
                }
                Err(_) => {
                    self.shared.tracker.cancel(xid);
                    debug!("Send of xid {} to {} timed out after {:?}", xid, self.server, timeout);
                    return Err(self.timed_out());
                }
            }
        };
        self.shared.resume.notify_one();
        trace!("Sent xid {} to {}, waiting {:?}", xid, self.server, timeout);

        match tokio::time::timeout_at(deadline, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(self.shared.tracker.failure().unwrap_or_else(|| {
                Error::ConnectionFailed {
                    server: self.server.clone(),
                    reason: format!("waiter for xid {xid} was released without a reply"),
                }
            })),
            Err(_) => {
                self.shared.tracker.cancel(xid);
                Err(self.timed_out())
            }
        }
    }

    fn timed_out(&self) -> Error {
        Error::Timeout { server: self.server.clone(), attempts: 1 }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .field("connected", &self.transport.is_connected())
            .field("waiting", &self.shared.tracker.waiting())
            .finish()
    }
}

async fn run_listener(
    server: String,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    idle_timeout: Duration,
) {
    let outcome =
        AssertUnwindSafe(listen(&server, transport.as_ref(), &shared, idle_timeout))
            .catch_unwind()
            .await;
    let reason = match outcome {
        Ok(err) => err.to_string(),
        Err(panic) => panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| String::from("listener panicked")),
    };
    error!("Listener for {} died: {}", server, reason);
    shared.tracker.fail_all(Error::ConnectionFailed { server, reason });
}

/// Receive loop. Only returns on a fatal transport error.
async fn listen(
    server: &str,
    transport: &dyn Transport,
    shared: &Shared,
    idle_timeout: Duration,
) -> Error {
    loop {
        if !transport.is_connected() {
            shared.resume.notified().await;
            continue;
        }

        // A record may be half read when the idle tick fires, so the receive
        // is only abandoned when the socket is dropped with it.
        let received = {
            let mut recv = transport.recv();
            loop {
                tokio::select! {
                    res = &mut recv => break Some(res),
                    _ = tokio::time::sleep(idle_timeout) => {
                        if shared.tracker.waiting() == 0 {
                            break None;
                        }
                    }
                }
            }
        };

        match received {
            Some(Ok(message)) => dispatch(server, shared, message),
            Some(Err(e @ Error::ConnectionFailed { .. })) => return e,
            Some(Err(e)) => {
                // Waiting callers time out and retransmit over a new socket.
                warn!("Receive from {} failed: {}", server, e);
                transport.disconnect().await;
            }
            None => {
                let _gate = shared.gate.write().await;
                if shared.tracker.waiting() == 0 {
                    debug!("Connection to {} idle for {:?}, suspending", server, idle_timeout);
                    transport.disconnect().await;
                }
            }
        }
    }
}

fn dispatch(server: &str, shared: &Shared, message: Vec<u8>) {
    let Some(xid) = message.get(..4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]])) else {
        warn!("Dropping runt message of {} bytes from {}", message.len(), server);
        return;
    };
    if !shared.tracker.complete(xid, message) {
        trace!("Dropping reply from {} for unknown xid {}", server, xid);
    }
}

/// Builds the transport for an endpoint. Replaced in tests.
pub type TransportFactory = dyn Fn(&Endpoint) -> Arc<dyn Transport> + Send + Sync;

/// Process-scoped map of live connections keyed by endpoint.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<Endpoint, Arc<Connection>>>,
    factory: Box<TransportFactory>,
    idle_timeout: Duration,
}

impl ConnectionRegistry {
    /// A registry that opens real TCP/UDP sockets.
    pub fn new(idle_timeout: Duration) -> Self {
        Self::with_factory(idle_timeout, |endpoint: &Endpoint| -> Arc<dyn Transport> {
            match endpoint.kind {
                TransportKind::Tcp => Arc::new(TcpTransport::new(endpoint.clone())),
                TransportKind::Udp => Arc::new(UdpTransport::new(endpoint.clone())),
            }
        })
    }

    pub fn with_factory<F>(idle_timeout: Duration, factory: F) -> Self
    where
        F: Fn(&Endpoint) -> Arc<dyn Transport> + Send + Sync + 'static,
    {
        Self { connections: Mutex::new(HashMap::new()), factory: Box::new(factory), idle_timeout }
    }

    /// Returns the live connection for `endpoint`, creating it on first use
    /// and replacing it if its listener has failed.
    pub fn get(&self, endpoint: &Endpoint) -> Arc<Connection> {
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(connection) = connections.get(endpoint) {
            if !connection.is_failed() {
                return connection.clone();
            }
            debug!("Replacing failed connection to {}", endpoint);
        }
        let connection = Connection::new((self.factory)(endpoint), self.idle_timeout);
        connections.insert(endpoint.clone(), connection.clone());
        connection
    }

    /// Registers a connection over an already built transport.
    pub fn insert(&self, transport: Arc<dyn Transport>) -> Arc<Connection> {
        let endpoint = transport.endpoint().clone();
        let connection = Connection::new(transport, self.idle_timeout);
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint, connection.clone());
        connection
    }

    /// Forgets the connection for `endpoint`. It closes once unused.
    pub fn remove(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner).remove(endpoint)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
