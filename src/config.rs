//! Client tuning knobs.
//!
//! One [`ClientConfig`] is shared by every connection, RPC client and file
//! object created from an [`NfsClient`](crate::nfs::NfsClient).

use std::time::Duration;

use crate::protocol::rpc::TransportKind;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long one attempt waits for its reply.
    pub timeout: Duration,
    /// Attempts per call before giving up with a timeout. `0` retries forever.
    pub retries: u32,
    /// A connection with no reply and no waiting caller for this long drops
    /// its socket until the next call.
    pub idle_timeout: Duration,
    /// Initial guess of the server transfer size; corrected by FSINFO and by
    /// short reads.
    pub block_size: usize,
    /// Upper bound of the block size whatever the server advertises.
    pub max_block_size: usize,
    /// Buffers loaded ahead of a sequential reader.
    pub read_ahead: usize,
    /// Buffers of one file that may be writing to the server at once.
    pub write_behind: usize,
    /// Buffers waiting in the commit state before a COMMIT is sent.
    pub commit_threshold: usize,
    /// Transport tried first; the other one is the fallback.
    pub transport: TransportKind,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
    pub machine_name: String,
    /// Transparent RPCSEC_GSS context refreshes allowed per call.
    pub max_auth_refresh: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            retries: 5,
            idle_timeout: Duration::from_secs(30),
            block_size: 8 * 1024,
            max_block_size: 64 * 1024,
            read_ahead: 2,
            write_behind: 4,
            commit_threshold: 8,
            transport: TransportKind::Tcp,
            uid: 0,
            gid: 0,
            gids: Vec::new(),
            machine_name: String::from("localhost"),
            max_auth_refresh: 1,
        }
    }
}

impl ClientConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.clamp(1, self.max_block_size);
        self
    }

    pub fn with_max_block_size(mut self, max_block_size: usize) -> Self {
        self.max_block_size = max_block_size.max(1);
        self.block_size = self.block_size.min(self.max_block_size);
        self
    }

    pub fn with_read_ahead(mut self, read_ahead: usize) -> Self {
        self.read_ahead = read_ahead;
        self
    }

    pub fn with_write_behind(mut self, write_behind: usize) -> Self {
        self.write_behind = write_behind.max(1);
        self
    }

    pub fn with_commit_threshold(mut self, commit_threshold: usize) -> Self {
        self.commit_threshold = commit_threshold;
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_identity(mut self, uid: u32, gid: u32, gids: Vec<u32>) -> Self {
        self.uid = uid;
        self.gid = gid;
        self.gids = gids;
        self
    }

    pub fn with_machine_name(mut self, machine_name: impl Into<String>) -> Self {
        self.machine_name = machine_name.into();
        self
    }

    pub fn with_max_auth_refresh(mut self, max_auth_refresh: u32) -> Self {
        self.max_auth_refresh = max_auth_refresh;
        self
    }

    /// Capacity of the XDR buffer of one call: the largest block plus room
    /// for the RPC header, credentials and procedure arguments.
    pub(crate) fn message_capacity(&self) -> usize {
        self.max_block_size + 4096
    }
}
