//! Cached file attributes.
//!
//! Attributes are trusted for a window that adapts to how recently the file
//! changed: a file modified a moment ago is likely to change again and is
//! re-checked after [`ACMIN`], one untouched for a long time is trusted for
//! up to [`ACMAX`].

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use filetime::FileTime;

use crate::xdr::nfs2::{self, fattr};
use crate::xdr::nfs3::{fattr3, ftype3};

/// Shortest attribute cache window.
pub const ACMIN: Duration = Duration::from_secs(3);
/// Longest attribute cache window.
pub const ACMAX: Duration = Duration::from_secs(60);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FileType {
    #[default]
    None,
    Regular,
    Directory,
    BlockDevice,
    CharDevice,
    Symlink,
    Socket,
    Fifo,
}

impl From<ftype3> for FileType {
    fn from(ftype: ftype3) -> Self {
        match ftype {
            ftype3::NF3REG => FileType::Regular,
            ftype3::NF3DIR => FileType::Directory,
            ftype3::NF3BLK => FileType::BlockDevice,
            ftype3::NF3CHR => FileType::CharDevice,
            ftype3::NF3LNK => FileType::Symlink,
            ftype3::NF3SOCK => FileType::Socket,
            ftype3::NF3FIFO => FileType::Fifo,
        }
    }
}

impl From<nfs2::ftype> for FileType {
    fn from(ftype: nfs2::ftype) -> Self {
        match ftype {
            nfs2::ftype::NFNON => FileType::None,
            nfs2::ftype::NFREG => FileType::Regular,
            nfs2::ftype::NFDIR => FileType::Directory,
            nfs2::ftype::NFBLK => FileType::BlockDevice,
            nfs2::ftype::NFCHR => FileType::CharDevice,
            nfs2::ftype::NFLNK => FileType::Symlink,
        }
    }
}

/// File attributes with their freshness deadline. Times are milliseconds
/// since the Unix epoch.
#[derive(Clone, Debug)]
pub struct Fattr {
    pub ftype: FileType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub used: u64,
    pub rdev: u64,
    pub fsid: u64,
    pub fileid: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    cache_time: Duration,
    valid_until: Instant,
}

impl Fattr {
    pub fn from_v3(attr: &fattr3) -> Self {
        Self::stamped(Self {
            ftype: attr.ftype.into(),
            mode: attr.mode,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            size: attr.size,
            used: attr.used,
            rdev: ((attr.rdev.specdata1 as u64) << 32) | attr.rdev.specdata2 as u64,
            fsid: attr.fsid,
            fileid: attr.fileid,
            atime: attr.atime.as_millis(),
            mtime: attr.mtime.as_millis(),
            ctime: attr.ctime.as_millis(),
            cache_time: ACMIN,
            valid_until: Instant::now(),
        })
    }

    pub fn from_v2(attr: &fattr) -> Self {
        Self::stamped(Self {
            ftype: attr.ftype.into(),
            mode: attr.mode,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            size: attr.size as u64,
            used: attr.blocks as u64 * attr.blocksize as u64,
            rdev: attr.rdev as u64,
            fsid: attr.fsid as u64,
            fileid: attr.fileid as u64,
            atime: attr.atime.as_millis(),
            mtime: attr.mtime.as_millis(),
            ctime: attr.ctime.as_millis(),
            cache_time: ACMIN,
            valid_until: Instant::now(),
        })
    }

    /// Computes the cache window from the age of the last modification.
    fn stamped(mut self) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        let age = Duration::from_millis(now.saturating_sub(self.mtime).max(0) as u64);
        self.cache_time = age.clamp(ACMIN, ACMAX);
        self.valid_until = Instant::now() + self.cache_time;
        self
    }

    /// True while the attributes may be used without asking the server.
    pub fn is_valid(&self) -> bool {
        Instant::now() < self.valid_until
    }

    pub fn cache_time(&self) -> Duration {
        self.cache_time
    }

    /// Forces the next access to refetch.
    pub fn invalidate(&mut self) {
        self.valid_until = Instant::now();
    }

    pub fn modified(&self) -> FileTime {
        let nanos = (self.mtime.rem_euclid(1000) * 1_000_000) as u32;
        FileTime::from_unix_time(self.mtime.div_euclid(1000), nanos)
    }

    pub fn is_file(&self) -> bool {
        self.ftype == FileType::Regular
    }

    pub fn is_directory(&self) -> bool {
        self.ftype == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.ftype == FileType::Symlink
    }
}
