//! NFS version 2 file attributes (RFC 1094 section 2.3.5).
//!
//! Only the attribute record is decoded here; the attribute cache accepts
//! either this or a version 3 [`fattr3`](super::nfs3::fattr3).

#![allow(dead_code)]
#![allow(non_camel_case_types)]

use std::io::{Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};

use super::*;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum ftype {
    #[default]
    NFNON = 0,
    NFREG = 1,
    NFDIR = 2,
    NFBLK = 3,
    NFCHR = 4,
    NFLNK = 5,
}
SerializeEnum!(ftype);
DeserializeEnum!(ftype);

/// Version 2 timestamps carry microseconds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct timeval {
    pub seconds: u32,
    pub useconds: u32,
}
DeserializeStruct!(timeval, seconds, useconds);
SerializeStruct!(timeval, seconds, useconds);

impl timeval {
    pub fn as_millis(&self) -> i64 {
        self.seconds as i64 * 1000 + (self.useconds / 1000) as i64
    }
}

/// Version 2 attributes. Sizes are 32 bits and `rdev`/`fsid`/`fileid` are
/// single words.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct fattr {
    pub ftype: ftype,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub blocksize: u32,
    pub rdev: u32,
    pub blocks: u32,
    pub fsid: u32,
    pub fileid: u32,
    pub atime: timeval,
    pub mtime: timeval,
    pub ctime: timeval,
}
DeserializeStruct!(
    fattr, ftype, mode, nlink, uid, gid, size, blocksize, rdev, blocks, fsid, fileid, atime,
    mtime, ctime
);
SerializeStruct!(
    fattr, ftype, mode, nlink, uid, gid, size, blocksize, rdev, blocks, fsid, fileid, atime,
    mtime, ctime
);
