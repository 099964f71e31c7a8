//! One block of a file's data cache.
//!
//! A buffer covers `[foffset, foffset + size)` of its file and moves
//! between four states:
//!
//! ```text
//!   Empty --load--> Loaded --copy_to--> Dirty --unload--> Commit
//!     |                ^                  ^                 |
//!     +----copy_to-----|------------------+                 |
//!                      +----------commit (same verifier)----+
//!                      Dirty <---commit (verifier changed)--+
//! ```
//!
//! Loads and unloads run on the buffer's own worker so a reader can start
//! several loads and a writer can leave unloads in flight. Callers wait on
//! the buffer's status channel rather than on the worker.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use super::command_queue::CommandQueue;
use super::fattr::Fattr;
use super::proto::Nfs3;
use crate::error::{Error, Result};
use crate::xdr::nfs3::file::stable_how;
use crate::xdr::nfs3::{nfs_fh3, post_op_attr, wcc_data, writeverf3};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BufferState {
    /// Nothing read from the server yet.
    #[default]
    Empty,
    /// Holds the server's data.
    Loaded,
    /// Holds data the server has not seen.
    Dirty,
    /// Written UNSTABLE, waiting for a COMMIT with the matching verifier.
    Commit,
}

/// What a file shares with all of its buffers.
#[derive(Debug)]
pub(crate) struct FileIo {
    pub nfs: Nfs3,
    pub fh: nfs_fh3,
    /// Limits the buffers of the file unloading at the same time.
    pub write_permits: Arc<Semaphore>,
    attr: Mutex<Option<Fattr>>,
}

impl FileIo {
    pub fn new(nfs: Nfs3, fh: nfs_fh3, write_behind: usize, attr: Option<Fattr>) -> Self {
        Self {
            nfs,
            fh,
            write_permits: Arc::new(Semaphore::new(write_behind.max(1))),
            attr: Mutex::new(attr),
        }
    }

    pub fn cached_attr(&self) -> Option<Fattr> {
        self.attr.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_attr(&self, attr: Fattr) {
        *self.attr.lock().unwrap_or_else(PoisonError::into_inner) = Some(attr);
    }

    pub fn invalidate_attr(&self) {
        if let Some(attr) = self.attr.lock().unwrap_or_else(PoisonError::into_inner).as_mut() {
            attr.invalidate();
        }
    }

    pub fn update_attr(&self, post: &post_op_attr) {
        if let Some(attr) = post.attributes() {
            self.set_attr(Fattr::from_v3(attr));
        }
    }

    pub fn update_wcc(&self, wcc: &wcc_data) {
        self.update_attr(&wcc.after);
    }

    /// Attributes, from the cache while they are fresh.
    pub async fn getattr(&self) -> Result<Fattr> {
        if let Some(attr) = self.cached_attr().filter(Fattr::is_valid) {
            return Ok(attr);
        }
        let attr = Fattr::from_v3(&self.nfs.getattr(&self.fh).await?);
        self.set_attr(attr.clone());
        Ok(attr)
    }
}

#[derive(Clone, Debug, Default)]
struct Status {
    state: BufferState,
    loading: bool,
    unloading: bool,
    /// Failure of the last load or unload.
    error: Option<Error>,
}

#[derive(Debug)]
struct Data {
    bytes: Vec<u8>,
    /// Bytes at the start of the block that hold file data.
    valid: usize,
    /// Bytes the server has not acknowledged as stable: `[min, max)`.
    min: usize,
    max: usize,
    verifier: Option<writeverf3>,
    /// The last READ returned less than asked without reaching EOF.
    short: bool,
    written: bool,
}

impl Data {
    fn is_dirty(&self) -> bool {
        self.min < self.max
    }

    /// Copies data read from the server at `at`, keeping bytes written
    /// since.
    fn merge(&mut self, at: usize, data: &[u8]) {
        let end = at + data.len();
        let (lo, hi) = if self.is_dirty() { (self.min, self.max) } else { (end, end) };
        for (range_start, range_end) in [(at, lo.clamp(at, end)), (hi.clamp(at, end), end)] {
            self.bytes[range_start..range_end]
                .copy_from_slice(&data[range_start - at..range_end - at]);
        }
        self.valid = self.valid.max(end);
    }
}

enum Command {
    Load,
    Unload { stable: stable_how, _permit: OwnedSemaphorePermit },
    Exit,
}

#[derive(Debug)]
struct Inner {
    io: Arc<FileIo>,
    index: usize,
    foffset: u64,
    size: usize,
    data: Mutex<Data>,
    status: watch::Sender<Status>,
}

impl Inner {
    fn data(&self) -> std::sync::MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn process(&self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Load => self.load().await,
            Command::Unload { stable, _permit } => self.unload(stable).await,
            Command::Exit => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    async fn load(&self) {
        trace!("Loading buffer {} at {}", self.index, self.foffset);
        let res = self.io.nfs.read(&self.io.fh, self.foffset, self.size as u32).await;
        match res {
            Ok(read) => {
                self.io.update_attr(&read.file_attributes);
                {
                    let mut data = self.data();
                    let count = read.data.len().min(self.size);
                    data.merge(0, &read.data[..count]);
                    data.short = count < self.size && !read.eof;
                }
                self.status.send_modify(|status| {
                    status.loading = false;
                    status.error = None;
                    if status.state == BufferState::Empty {
                        status.state = BufferState::Loaded;
                    }
                });
            }
            Err(e) => {
                debug!("Load of buffer {} failed: {}", self.index, e);
                self.status.send_modify(|status| {
                    status.loading = false;
                    status.error = Some(e);
                });
            }
        }
    }

    async fn unload(&self, stable: stable_how) {
        let (start, pending) = {
            let data = self.data();
            (data.min, data.bytes[data.min..data.max].to_vec())
        };
        if pending.is_empty() {
            self.status.send_modify(|status| status.unloading = false);
            return;
        }

        trace!("Unloading buffer {}: {} bytes at {}", self.index, pending.len(), start);
        let mut sent = 0;
        let mut committed = stable_how::FILE_SYNC;
        let mut verifier = writeverf3::default();
        while sent < pending.len() {
            let offset = self.foffset + (start + sent) as u64;
            match self.io.nfs.write(&self.io.fh, offset, &pending[sent..], stable).await {
                Ok(res) if res.count == 0 => {
                    self.fail_unload(Error::Protocol(String::from("server accepted no data")));
                    return;
                }
                Ok(res) => {
                    self.io.update_wcc(&res.file_wcc);
                    sent += (res.count as usize).min(pending.len() - sent);
                    committed = committed.min(res.committed);
                    verifier = res.verf;
                }
                Err(e) => {
                    self.fail_unload(e);
                    return;
                }
            }
        }

        let state = {
            let mut data = self.data();
            data.verifier = Some(verifier);
            data.written = true;
            if committed == stable_how::UNSTABLE {
                BufferState::Commit
            } else {
                data.min = 0;
                data.max = 0;
                BufferState::Loaded
            }
        };
        self.status.send_modify(|status| {
            status.unloading = false;
            status.error = None;
            status.state = state;
        });
    }

    fn fail_unload(&self, e: Error) {
        warn!("Write of buffer {} failed: {}", self.index, e);
        self.status.send_modify(|status| {
            status.unloading = false;
            status.error = Some(e);
        });
    }

    async fn wait_loaded(&self) -> Result<()> {
        let mut rx = self.status.subscribe();
        let status = rx.wait_for(|status| !status.loading).await.map_err(worker_gone)?;
        match &status.error {
            Some(e) if status.state == BufferState::Empty => Err(e.clone()),
            _ => Ok(()),
        }
    }
}

fn worker_gone(_: watch::error::RecvError) -> Error {
    Error::Protocol(String::from("buffer worker has exited"))
}

/// A cache block with its worker.
#[derive(Debug)]
pub(crate) struct Buffer {
    inner: Arc<Inner>,
    queue: CommandQueue<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Load => f.write_str("Load"),
            Command::Unload { stable, .. } => write!(f, "Unload({stable:?})"),
            Command::Exit => f.write_str("Exit"),
        }
    }
}

impl Buffer {
    pub fn new(io: Arc<FileIo>, index: usize, size: usize) -> Self {
        let inner = Arc::new(Inner {
            io,
            index,
            foffset: (index * size) as u64,
            size,
            data: Mutex::new(Data {
                bytes: vec![0; size],
                valid: 0,
                min: 0,
                max: 0,
                verifier: None,
                short: false,
                written: false,
            }),
            status: watch::Sender::new(Status::default()),
        });
        let worker = inner.clone();
        let queue = CommandQueue::spawn(format!("buffer {index}"), move |command| {
            let worker = worker.clone();
            async move { worker.process(command).await }
        });
        Self { inner, queue }
    }

    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn foffset(&self) -> u64 {
        self.inner.foffset
    }

    pub fn state(&self) -> BufferState {
        self.inner.status.borrow().state
    }

    /// A load or unload is queued or running.
    pub fn is_busy(&self) -> bool {
        let status = self.inner.status.borrow();
        status.loading || status.unloading
    }

    pub fn is_unloading(&self) -> bool {
        self.inner.status.borrow().unloading
    }

    pub fn verifier(&self) -> Option<writeverf3> {
        self.inner.data().verifier
    }

    /// Unacknowledged bytes as a file range.
    pub fn dirty_range(&self) -> Option<(u64, u64)> {
        let data = self.inner.data();
        data.is_dirty()
            .then(|| (self.inner.foffset + data.min as u64, self.inner.foffset + data.max as u64))
    }

    /// Bytes the server returned for the first READ, when fewer than asked
    /// before end of file.
    pub fn short_read(&self) -> Option<usize> {
        let data = self.inner.data();
        data.short.then_some(data.valid)
    }

    /// The buffer took part in a write since it was created.
    pub fn was_written(&self) -> bool {
        self.inner.data().written
    }

    /// Queues a READ of the block unless it is loaded, loading or dirty.
    pub fn start_load(&self) -> Result<()> {
        let mut queued = false;
        self.inner.status.send_if_modified(|status| {
            if status.state == BufferState::Empty && !status.loading {
                status.loading = true;
                status.error = None;
                queued = true;
            }
            queued
        });
        if queued {
            self.queue.submit(Command::Load)?;
        }
        Ok(())
    }

    /// Starts a load if needed and waits for it.
    pub async fn loaded(&self) -> Result<()> {
        self.start_load()?;
        self.inner.wait_loaded().await
    }

    /// Copies block bytes from `offset` into `dst`. Returns the number of
    /// bytes copied, which is short only at the end of the file data.
    ///
    /// `file_length` is the current length of the file. Block bytes below it
    /// that the last READ did not return are read again first, so a block
    /// loaded at the old end of a file that has since grown is topped up.
    pub async fn copy_from(
        &self,
        dst: &mut [u8],
        offset: usize,
        file_length: u64,
    ) -> Result<usize> {
        self.loaded().await?;
        let in_file = file_length.saturating_sub(self.inner.foffset).min(self.inner.size as u64);
        self.fill((offset + dst.len()).min(in_file as usize)).await?;

        let data = self.inner.data();
        let available = data.valid.saturating_sub(offset).min(dst.len());
        dst[..available].copy_from_slice(&data.bytes[offset..offset + available]);
        Ok(available)
    }

    /// Reads the rest of the block until `want` bytes are valid or the
    /// server has nothing more.
    async fn fill(&self, want: usize) -> Result<()> {
        loop {
            let valid = self.inner.data().valid;
            if valid >= want {
                return Ok(());
            }
            let io = &self.inner.io;
            let offset = self.inner.foffset + valid as u64;
            let asked = self.inner.size - valid;
            let read = io.nfs.read(&io.fh, offset, asked as u32).await?;
            io.update_attr(&read.file_attributes);
            let count = read.data.len().min(asked);
            {
                let mut data = self.inner.data();
                data.merge(valid, &read.data[..count]);
                data.short = count < asked && !read.eof;
            }
            if count == 0 {
                return Ok(());
            }
        }
    }

    /// Copies `src` into the block at `offset` and marks it dirty.
    ///
    /// A partial write to a block that holds file data needs the rest of
    /// the block first, so an empty buffer is loaded. `file_length` is the
    /// file length before this write.
    ///
    /// Fails with the error of an unload that did not reach the server.
    pub async fn copy_to(&self, src: &[u8], offset: usize, file_length: u64) -> Result<()> {
        self.wait_unloaded().await?;

        let end = offset + src.len();
        let partial = offset > 0 || end < self.inner.size;
        if self.state() == BufferState::Empty && partial && self.inner.foffset < file_length {
            self.loaded().await?;
        }

        {
            let mut data = self.inner.data();
            data.bytes[offset..end].copy_from_slice(src);
            if data.is_dirty() {
                data.min = data.min.min(offset);
                data.max = data.max.max(end);
            } else {
                data.min = offset;
                data.max = end;
            }
            data.valid = data.valid.max(end);
        }
        self.inner.status.send_modify(|status| status.state = BufferState::Dirty);
        Ok(())
    }

    /// Queues a WRITE of the dirty bytes. Waits for a write permit of the
    /// file first, so no more than the write-behind limit are in flight.
    pub async fn start_unload(&self, stable: stable_how) -> Result<()> {
        {
            let status = self.inner.status.borrow();
            if status.state != BufferState::Dirty || status.unloading {
                return Ok(());
            }
        }
        let permit = self
            .inner
            .io
            .write_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Protocol(String::from("write permits closed")))?;
        self.inner.status.send_modify(|status| {
            status.unloading = true;
            status.error = None;
        });
        self.queue.submit(Command::Unload { stable, _permit: permit })
    }

    /// Waits for a queued unload and reports its failure.
    pub async fn wait_unloaded(&self) -> Result<()> {
        let mut rx = self.inner.status.subscribe();
        let status = rx.wait_for(|status| !status.unloading).await.map_err(worker_gone)?;
        match &status.error {
            Some(e) if status.state == BufferState::Dirty => Err(e.clone()),
            _ => Ok(()),
        }
    }

    /// Waits until no load or unload is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.status.subscribe();
        let _ = rx.wait_for(|status| !status.loading && !status.unloading).await;
    }

    /// A COMMIT confirmed the written data.
    pub fn mark_committed(&self) {
        {
            let mut data = self.inner.data();
            data.min = 0;
            data.max = 0;
        }
        self.inner.status.send_modify(|status| {
            if status.state == BufferState::Commit {
                status.state = BufferState::Loaded;
            }
        });
    }

    /// The server lost the unstable data; it has to be written again.
    pub fn mark_lost(&self) {
        self.inner.status.send_modify(|status| {
            if status.state == BufferState::Commit {
                status.state = BufferState::Dirty;
            }
        });
    }

    /// Stops the worker once queued commands are done.
    pub fn exit(self) {
        trace!("Releasing buffer {}", self.inner.index);
        self.queue.submit(Command::Exit).ok();
    }
}
