//! Arguments and results of the procedures that move file data and
//! attributes: GETATTR, ACCESS, READ, WRITE and COMMIT.

#![allow(dead_code)]
#![allow(non_camel_case_types)]

use std::io::{Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};

use super::*;

#[derive(Copy, Clone, Debug, Default)]
pub struct GETATTR3resok {
    pub obj_attributes: fattr3,
}
DeserializeStruct!(GETATTR3resok, obj_attributes);
SerializeStruct!(GETATTR3resok, obj_attributes);

#[derive(Clone, Debug, Default)]
pub struct ACCESS3args {
    pub object: nfs_fh3,
    /// Bit mask of `ACCESS3_*` rights to check
    pub access: u32,
}
DeserializeStruct!(ACCESS3args, object, access);
SerializeStruct!(ACCESS3args, object, access);

#[derive(Copy, Clone, Debug, Default)]
pub struct ACCESS3resok {
    pub obj_attributes: post_op_attr,
    /// The subset of the requested rights the caller holds
    pub access: u32,
}
DeserializeStruct!(ACCESS3resok, obj_attributes, access);
SerializeStruct!(ACCESS3resok, obj_attributes, access);

#[derive(Clone, Debug, Default)]
pub struct READ3args {
    pub file: nfs_fh3,
    pub offset: offset3,
    pub count: count3,
}
DeserializeStruct!(READ3args, file, offset, count);
SerializeStruct!(READ3args, file, offset, count);

/// A successful READ. `count` may be smaller than requested even before
/// end of file: servers cap it at their own transfer size.
#[derive(Clone, Debug, Default)]
pub struct READ3resok {
    pub file_attributes: post_op_attr,
    pub count: count3,
    pub eof: bool,
    pub data: Vec<u8>,
}
DeserializeStruct!(READ3resok, file_attributes, count, eof, data);
SerializeStruct!(READ3resok, file_attributes, count, eof, data);

/// How far the server must push written data before replying.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum stable_how {
    /// May be cached on the server until a COMMIT
    #[default]
    UNSTABLE = 0,
    DATA_SYNC = 1,
    FILE_SYNC = 2,
}
SerializeEnum!(stable_how);
DeserializeEnum!(stable_how);

#[derive(Clone, Debug, Default)]
pub struct WRITE3args {
    pub file: nfs_fh3,
    pub offset: offset3,
    pub count: count3,
    pub stable: stable_how,
    pub data: Vec<u8>,
}
DeserializeStruct!(WRITE3args, file, offset, count, stable, data);
SerializeStruct!(WRITE3args, file, offset, count, stable, data);

#[derive(Copy, Clone, Debug, Default)]
pub struct WRITE3resok {
    pub file_wcc: wcc_data,
    /// Bytes actually written, possibly fewer than sent
    pub count: count3,
    pub committed: stable_how,
    pub verf: writeverf3,
}
DeserializeStruct!(WRITE3resok, file_wcc, count, committed, verf);
SerializeStruct!(WRITE3resok, file_wcc, count, committed, verf);

#[derive(Clone, Debug, Default)]
pub struct COMMIT3args {
    pub file: nfs_fh3,
    pub offset: offset3,
    /// Zero means "to the end of the file"
    pub count: count3,
}
DeserializeStruct!(COMMIT3args, file, offset, count);
SerializeStruct!(COMMIT3args, file, offset, count);

/// A successful COMMIT. Data written UNSTABLE under a different verifier
/// may have been lost and must be sent again.
#[derive(Copy, Clone, Debug, Default)]
pub struct COMMIT3resok {
    pub file_wcc: wcc_data,
    pub verf: writeverf3,
}
DeserializeStruct!(COMMIT3resok, file_wcc, verf);
SerializeStruct!(COMMIT3resok, file_wcc, verf);
