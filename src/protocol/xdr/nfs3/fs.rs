//! FSINFO (RFC 1813 section 3.3.19): static file system information.
//!
//! The client only cares about the transfer sizes; `rtpref` and `wtpref`
//! become the block size of the buffer cache.

#![allow(dead_code)]
#![allow(non_camel_case_types)]

use std::io::{Read, Write};

use super::*;

pub const FSF_LINK: u32 = 0x0001;
pub const FSF_SYMLINK: u32 = 0x0002;
pub const FSF_HOMOGENEOUS: u32 = 0x0008;
pub const FSF_CANSETTIME: u32 = 0x0010;

#[derive(Copy, Clone, Debug, Default)]
pub struct fsinfo3 {
    pub obj_attributes: post_op_attr,
    /// Largest READ the server accepts
    pub rtmax: u32,
    /// Preferred READ size
    pub rtpref: u32,
    pub rtmult: u32,
    /// Largest WRITE the server accepts
    pub wtmax: u32,
    /// Preferred WRITE size
    pub wtpref: u32,
    pub wtmult: u32,
    pub dtpref: u32,
    pub maxfilesize: size3,
    pub time_delta: nfstime3,
    pub properties: u32,
}
DeserializeStruct!(
    fsinfo3,
    obj_attributes,
    rtmax,
    rtpref,
    rtmult,
    wtmax,
    wtpref,
    wtmult,
    dtpref,
    maxfilesize,
    time_delta,
    properties
);
SerializeStruct!(
    fsinfo3,
    obj_attributes,
    rtmax,
    rtpref,
    rtmult,
    wtmax,
    wtpref,
    wtmult,
    dtpref,
    maxfilesize,
    time_delta,
    properties
);
