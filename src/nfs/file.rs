//! A file or directory on an NFS server, with its data and metadata caches.
//!
//! Data moves through block-sized [`Buffer`]s. Sequential readers get the
//! next `read_ahead` blocks loaded in the background; writers leave dirty
//! blocks unloading behind them and the data is committed in batches.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use tracing_attributes::instrument;

use super::buffer::{Buffer, BufferState, FileIo};
use super::client::ClientShared;
use super::fattr::Fattr;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::url::NfsUrl;
use crate::xdr::nfs3::file::stable_how;
use crate::xdr::nfs3::{
    cookieverf3, nfs_fh3, nfsstat3, ACCESS3_EXTEND, ACCESS3_MODIFY, ACCESS3_READ,
};

/// Byte count asked for per READDIR reply.
const READDIR_COUNT: u32 = 8192;

struct Cache {
    buffers: Vec<Option<Buffer>>,
    block_size: usize,
    /// FSINFO was asked before the first write.
    sized: bool,
    last_read: Option<usize>,
    current_write: Option<usize>,
    /// End of data written through this object and not yet flushed.
    written_length: u64,
}

impl Cache {
    fn get(&self, index: usize) -> Option<&Buffer> {
        self.buffers.get(index).and_then(Option::as_ref)
    }

    fn buffer(&mut self, io: &Arc<FileIo>, index: usize) -> &Buffer {
        if self.buffers.len() <= index {
            self.buffers.resize_with(index + 1, || None);
        }
        let size = self.block_size;
        self.buffers[index].get_or_insert_with(|| Buffer::new(io.clone(), index, size))
    }

    fn is_active(&self, index: usize) -> bool {
        self.last_read == Some(index) || self.current_write == Some(index)
    }

    fn release(&mut self, index: usize) {
        if let Some(buffer) = self.buffers.get_mut(index).and_then(Option::take) {
            buffer.exit();
        }
        if self.last_read == Some(index) {
            self.last_read = None;
        }
    }

    /// Releases a buffer that holds nothing the server lacks.
    fn release_clean(&mut self, index: usize) {
        let clean = self
            .get(index)
            .is_some_and(|b| matches!(b.state(), BufferState::Empty | BufferState::Loaded));
        if clean {
            self.release(index);
        }
    }

    /// Some buffer holds data the server has not made stable.
    fn has_unstable(&self) -> bool {
        self.buffers
            .iter()
            .flatten()
            .any(|b| {
                matches!(b.state(), BufferState::Dirty | BufferState::Commit) || b.is_unloading()
            })
    }

    /// Drops every buffer and starts over with blocks of `block_size`.
    fn resize(&mut self, block_size: usize) {
        for buffer in self.buffers.drain(..).flatten() {
            buffer.exit();
        }
        self.block_size = block_size;
        self.last_read = None;
        self.current_write = None;
    }

    fn release_all(&mut self) {
        for buffer in self.buffers.drain(..).flatten() {
            buffer.exit();
        }
        self.last_read = None;
        self.current_write = None;
    }
}

#[derive(Default)]
struct Meta {
    /// Directory entries with the mtime they were listed at.
    listing: Option<(i64, Vec<String>)>,
    link: Option<String>,
    /// Rights asked for and granted, with the mtime they were checked at.
    access: Option<(u32, u32, i64)>,
}

/// An open file or directory. Obtained from
/// [`NfsClient::open`](super::NfsClient::open) and shared by every caller
/// that opens the same URL.
pub struct NfsFile {
    client: Weak<ClientShared>,
    url: NfsUrl,
    io: Arc<FileIo>,
    config: ClientConfig,
    cache: AsyncMutex<Cache>,
    meta: Mutex<Meta>,
}

impl NfsFile {
    pub(crate) fn new(
        client: Weak<ClientShared>,
        url: NfsUrl,
        io: FileIo,
        config: ClientConfig,
    ) -> Self {
        let cache = Cache {
            buffers: Vec::new(),
            block_size: config.block_size.clamp(1, config.max_block_size),
            sized: false,
            last_read: None,
            current_write: None,
            written_length: 0,
        };
        Self {
            client,
            url,
            io: Arc::new(io),
            config,
            cache: AsyncMutex::new(cache),
            meta: Mutex::new(Meta::default()),
        }
    }

    pub fn url(&self) -> &NfsUrl {
        &self.url
    }

    pub fn name(&self) -> &str {
        self.url.name()
    }

    pub(crate) fn fh(&self) -> &nfs_fh3 {
        &self.io.fh
    }

    fn meta(&self) -> std::sync::MutexGuard<'_, Meta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self) -> Result<Arc<ClientShared>> {
        self.client.upgrade().ok_or_else(|| Error::Protocol(String::from("NFS client was dropped")))
    }

    pub async fn attributes(&self) -> Result<Fattr> {
        self.io.getattr().await
    }

    /// Length including data written but not yet flushed.
    pub async fn length(&self) -> Result<u64> {
        let cache = self.cache.lock().await;
        self.length_with(&cache).await
    }

    async fn length_with(&self, cache: &Cache) -> Result<u64> {
        Ok(self.io.getattr().await?.size.max(cache.written_length))
    }

    /// Modification time in milliseconds since the Unix epoch.
    pub async fn last_modified(&self) -> Result<i64> {
        Ok(self.io.getattr().await?.mtime)
    }

    /// False once the server no longer knows the file.
    pub async fn exists(&self) -> Result<bool> {
        self.io.invalidate_attr();
        match self.io.getattr().await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn is_file(&self) -> Result<bool> {
        Ok(self.io.getattr().await?.is_file())
    }

    pub async fn is_directory(&self) -> Result<bool> {
        Ok(self.io.getattr().await?.is_directory())
    }

    pub async fn is_symlink(&self) -> Result<bool> {
        Ok(self.io.getattr().await?.is_symlink())
    }

    pub async fn can_read(&self) -> Result<bool> {
        self.check_access(ACCESS3_READ).await
    }

    pub async fn can_write(&self) -> Result<bool> {
        self.check_access(ACCESS3_MODIFY | ACCESS3_EXTEND).await
    }

    /// ACCESS, answered from the cache while the attributes are fresh and
    /// the file is unchanged.
    async fn check_access(&self, wanted: u32) -> Result<bool> {
        let attr = self.io.getattr().await?;
        let cached = self.meta().access;
        if let Some((asked, granted, mtime)) = cached {
            if asked & wanted == wanted && mtime == attr.mtime {
                return Ok(granted & wanted == wanted);
            }
        }
        let asked = ACCESS3_READ | ACCESS3_MODIFY | ACCESS3_EXTEND;
        let res = self.io.nfs.access(&self.io.fh, asked).await?;
        self.io.update_attr(&res.obj_attributes);
        self.meta().access = Some((asked, res.access, attr.mtime));
        Ok(res.access & wanted == wanted)
    }

    /// Forgets cached attributes, listing, link target and access rights.
    pub fn invalidate(&self) {
        self.io.invalidate_attr();
        *self.meta() = Meta::default();
    }

    /// Reads into `buf` from `foffset`. Returns the number of bytes read,
    /// `0` at or past the end of the file.
    pub async fn read(&self, buf: &mut [u8], foffset: u64) -> Result<usize> {
        let mut cache = self.cache.lock().await;
        'restart: loop {
            let length = self.length_with(&cache).await?;
            if foffset >= length || buf.is_empty() {
                return Ok(0);
            }
            let want = buf.len().min(usize::try_from(length - foffset).unwrap_or(usize::MAX));
            let block_size = cache.block_size;

            let mut done = 0;
            while done < want {
                let offset = foffset + done as u64;
                let index = (offset / block_size as u64) as usize;
                let boff = (offset % block_size as u64) as usize;

                let sequential = offset == 0
                    || cache.last_read.is_some_and(|last| index == last || index == last + 1);
                if sequential {
                    for ahead in index + 1..=index + self.config.read_ahead {
                        if (ahead * block_size) as u64 >= length {
                            break;
                        }
                        cache.buffer(&self.io, ahead).start_load()?;
                    }
                }

                let short = {
                    let buffer = cache.buffer(&self.io, index);
                    buffer.loaded().await?;
                    buffer.short_read()
                };
                if let Some(returned) = short {
                    if returned > 0 && !cache.has_unstable() {
                        info!(
                            "Server returned {} of {} bytes for {}; using smaller blocks",
                            returned, block_size, self.url
                        );
                        cache.resize(returned);
                        continue 'restart;
                    }
                }

                let len = (want - done).min(block_size - boff);
                let buffer = cache.buffer(&self.io, index);
                let n = buffer.copy_from(&mut buf[done..done + len], boff, length).await?;

                if let Some(last) = cache.last_read.filter(|&last| last != index) {
                    if cache.current_write != Some(last) {
                        cache.release_clean(last);
                    }
                }
                cache.last_read = Some(index);
                done += n;
                if n < len {
                    break;
                }
            }
            return Ok(done);
        }
    }

    /// Writes `data` at `foffset`. The data reaches the server in the
    /// background; [`flush`](Self::flush) waits for it.
    ///
    /// A failed background write of a block is returned by the next write to
    /// that block. The data stays dirty and `flush` writes it again.
    pub async fn write(&self, data: &[u8], foffset: u64) -> Result<()> {
        let mut cache = self.cache.lock().await;
        if !cache.sized {
            self.size_blocks(&mut cache).await;
        }
        let file_length = self.length_with(&cache).await?;

        let mut done = 0;
        while done < data.len() {
            let block_size = cache.block_size;
            let offset = foffset + done as u64;
            let index = (offset / block_size as u64) as usize;
            let boff = (offset % block_size as u64) as usize;
            let len = (data.len() - done).min(block_size - boff);

            if let Some(previous) = cache.current_write.filter(|&current| current != index) {
                if let Some(buffer) = cache.get(previous) {
                    buffer.start_unload(stable_how::UNSTABLE).await?;
                }
            }
            cache.current_write = Some(index);
            let buffer = cache.buffer(&self.io, index);
            buffer.copy_to(&data[done..done + len], boff, file_length).await?;
            cache.written_length = cache.written_length.max(offset + len as u64);
            done += len;
        }

        self.check_commit(&mut cache, false).await
    }

    /// Uses the server's preferred write size as the block size.
    async fn size_blocks(&self, cache: &mut Cache) {
        cache.sized = true;
        match self.io.nfs.fsinfo(&self.io.fh).await {
            Ok(info) => {
                self.io.update_attr(&info.obj_attributes);
                let preferred = if info.wtpref > 0 { info.wtpref } else { info.wtmax };
                let block_size = (preferred as usize).min(self.config.max_block_size);
                if block_size > 0 && block_size != cache.block_size && !cache.has_unstable() {
                    debug!("Block size of {} is {}", self.url, block_size);
                    cache.resize(block_size);
                }
            }
            Err(e) => warn!(
                "FSINFO for {} failed, keeping {} byte blocks: {}",
                self.url, cache.block_size, e
            ),
        }
    }

    /// Releases written buffers that are done and commits the ones waiting
    /// in the commit state once there are more than the commit threshold,
    /// or any at all when `flushing`.
    ///
    /// Buffers whose verifier differs from the COMMIT reply were lost by
    /// the server and are written again; when flushing, synchronously and
    /// stable.
    async fn check_commit(&self, cache: &mut Cache, flushing: bool) -> Result<()> {
        let mut done = Vec::new();
        let mut pending = Vec::new();
        let mut range: Option<(u64, u64)> = None;
        for (index, buffer) in cache.buffers.iter().enumerate() {
            let Some(buffer) = buffer else { continue };
            if buffer.is_busy() {
                continue;
            }
            match buffer.state() {
                BufferState::Loaded if buffer.was_written() && !cache.is_active(index) => {
                    done.push(index);
                }
                BufferState::Commit => {
                    if let Some((start, end)) = buffer.dirty_range() {
                        range = Some(match range {
                            Some((lo, hi)) => (lo.min(start), hi.max(end)),
                            None => (start, end),
                        });
                    }
                    pending.push(index);
                }
                _ => {}
            }
        }
        for index in done {
            cache.release(index);
        }

        let Some((start, end)) = range else { return Ok(()) };
        if !flushing && pending.len() <= self.config.commit_threshold {
            return Ok(());
        }

        debug!("Committing {} buffers of {}: [{}, {})", pending.len(), self.url, start, end);
        let count = u32::try_from(end - start).unwrap_or(0);
        let res = self.io.nfs.commit(&self.io.fh, start, count).await?;
        self.io.update_wcc(&res.file_wcc);

        let stable = if flushing { stable_how::FILE_SYNC } else { stable_how::UNSTABLE };
        let mut rewrite = Vec::new();
        for index in pending {
            let Some(buffer) = cache.get(index) else { continue };
            if buffer.verifier() == Some(res.verf) {
                buffer.mark_committed();
                if !cache.is_active(index) {
                    cache.release(index);
                }
            } else {
                warn!("Write verifier of {} changed; rewriting buffer {}", self.url, index);
                buffer.mark_lost();
                buffer.start_unload(stable).await?;
                rewrite.push(index);
            }
        }
        if flushing {
            for index in rewrite {
                if let Some(buffer) = cache.get(index) {
                    buffer.wait_unloaded().await?;
                }
            }
        }
        Ok(())
    }

    /// Sends every written byte to the server and commits it.
    #[instrument(level = "debug", skip(self), fields(url = %self.url))]
    pub async fn flush(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        self.flush_with(&mut cache).await
    }

    async fn flush_with(&self, cache: &mut Cache) -> Result<()> {
        for buffer in cache.buffers.iter().flatten() {
            buffer.start_unload(stable_how::UNSTABLE).await?;
        }
        for buffer in cache.buffers.iter().flatten() {
            buffer.wait_unloaded().await?;
        }
        self.check_commit(cache, true).await?;
        cache.current_write = None;
        if cache.written_length > 0 {
            cache.written_length = 0;
            self.io.invalidate_attr();
        }
        Ok(())
    }

    /// Flushes and releases every buffer. The object stays usable.
    #[instrument(level = "debug", skip(self), fields(url = %self.url))]
    pub async fn close(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let res = self.flush_with(&mut cache).await;
        for buffer in cache.buffers.iter().flatten() {
            buffer.wait_idle().await;
        }
        cache.release_all();
        res
    }

    /// States of the buffers currently held, by block index.
    pub async fn resident_buffers(&self) -> Vec<(usize, BufferState)> {
        let cache = self.cache.lock().await;
        cache.buffers.iter().flatten().map(|b| (b.index(), b.state())).collect()
    }

    pub async fn block_size(&self) -> usize {
        self.cache.lock().await.block_size
    }

    /// Names in the directory, without `.` and `..`. Cached until the
    /// directory changes.
    pub async fn read_dir(&self) -> Result<Vec<String>> {
        let attr = self.io.getattr().await?;
        let cached = self.meta().listing.clone();
        if let Some((mtime, names)) = cached {
            if mtime == attr.mtime {
                return Ok(names);
            }
        }

        let mut names = Vec::new();
        let mut cookie = 0;
        let mut cookieverf = cookieverf3::default();
        loop {
            let res = self.io.nfs.readdir(&self.io.fh, cookie, cookieverf, READDIR_COUNT).await?;
            self.io.update_attr(&res.dir_attributes);
            cookieverf = res.cookieverf;
            for entry in &res.reply.entries {
                cookie = entry.cookie;
                let name = entry.name.to_string_lossy();
                if name != "." && name != ".." {
                    names.push(name);
                }
            }
            if res.reply.eof || res.reply.entries.is_empty() {
                break;
            }
        }
        self.meta().listing = Some((attr.mtime, names.clone()));
        Ok(names)
    }

    /// Target of a symbolic link.
    pub async fn read_link(&self) -> Result<String> {
        let cached = self.meta().link.clone();
        if let Some(link) = cached {
            return Ok(link);
        }
        let res = self.io.nfs.readlink(&self.io.fh).await?;
        self.io.update_attr(&res.symlink_attributes);
        let link = res.data.to_string_lossy();
        self.meta().link = Some(link.clone());
        Ok(link)
    }

    /// Opens `name` in this directory.
    pub async fn lookup(&self, name: &str) -> Result<Arc<NfsFile>> {
        self.client()?.open(&self.url.join(name)).await
    }

    /// Creates a regular file in this directory. An existing file of that
    /// name is kept as it is.
    pub async fn create(&self, name: &str, mode: u32) -> Result<Arc<NfsFile>> {
        let res = self.io.nfs.create(&self.io.fh, name, mode).await?;
        self.io.update_wcc(&res.dir_wcc);
        self.meta().listing = None;
        self.client()?.adopt(&self.io.nfs, &self.io.fh, self.url.join(name), res).await
    }

    pub async fn mkdir(&self, name: &str, mode: u32) -> Result<Arc<NfsFile>> {
        let res = self.io.nfs.mkdir(&self.io.fh, name, mode).await?;
        self.io.update_wcc(&res.dir_wcc);
        self.meta().listing = None;
        self.client()?.adopt(&self.io.nfs, &self.io.fh, self.url.join(name), res).await
    }

    /// Removes this file, or this directory if it is empty.
    pub async fn remove(&self) -> Result<()> {
        let client = self.client()?;
        let parent_url = self.url.parent().ok_or(Error::Nfs(nfsstat3::NFS3ERR_INVAL))?;
        let parent = client.open(&parent_url).await?;
        let wcc = if self.is_directory().await? {
            self.io.nfs.rmdir(&parent.io.fh, self.name()).await?
        } else {
            self.io.nfs.remove(&parent.io.fh, self.name()).await?
        };
        parent.io.update_wcc(&wcc);
        parent.meta().listing = None;
        self.cache.lock().await.release_all();
        self.invalidate();
        client.forget(&self.url);
        Ok(())
    }

    /// Moves this file to `name` in `dir` and returns the file at its new
    /// place.
    pub async fn rename(&self, dir: &NfsFile, name: &str) -> Result<Arc<NfsFile>> {
        let client = self.client()?;
        let parent_url = self.url.parent().ok_or(Error::Nfs(nfsstat3::NFS3ERR_INVAL))?;
        let parent = client.open(&parent_url).await?;
        self.flush().await?;
        let res = self.io.nfs.rename(&parent.io.fh, self.name(), &dir.io.fh, name).await?;
        parent.io.update_wcc(&res.fromdir_wcc);
        dir.io.update_wcc(&res.todir_wcc);
        parent.meta().listing = None;
        dir.meta().listing = None;
        client.forget(&self.url);
        client.open(&dir.url.join(name)).await
    }
}

impl std::fmt::Debug for NfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NfsFile").field("url", &self.url).field("fh", &self.io.fh).finish()
    }
}
