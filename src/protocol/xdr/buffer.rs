//! Fixed-capacity XDR wire buffer.
//!
//! A call is encoded into one `XdrBuffer` and a reply is decoded out of one.
//! The buffer never grows: writes past its capacity fail, and reads past
//! the valid size of received data fail with a decoding error.
//!
//! Besides the cursor, the buffer records a *wrap offset*: the position
//! where procedure arguments start. The RPCSEC_GSS layer uses it to know
//! which bytes to checksum or encrypt once the arguments are in place.

use std::io::{Read, Write};

use super::{deserialize, utils, Deserialize, Serialize};
use crate::error::{Error, Result};

pub struct XdrBuffer {
    buf: Vec<u8>,
    off: usize,
    size: usize,
    wrap_offset: usize,
}

impl XdrBuffer {
    /// Creates an empty buffer for encoding, able to hold `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self { buf: vec![0; capacity], off: 0, size: 0, wrap_offset: 0 }
    }

    /// Wraps received data for decoding. The valid size is the data length.
    pub fn from_received(data: Vec<u8>) -> Self {
        let size = data.len();
        Self { buf: data, off: 0, size, wrap_offset: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Current cursor position.
    pub fn offset(&self) -> usize {
        self.off
    }

    pub fn set_offset(&mut self, off: usize) {
        self.off = off;
    }

    /// Number of valid bytes for decoding.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_size(&mut self, size: usize) {
        self.size = size.min(self.buf.len());
    }

    pub fn wrap_offset(&self) -> usize {
        self.wrap_offset
    }

    pub fn set_wrap_offset(&mut self, off: usize) {
        self.wrap_offset = off;
    }

    /// Bytes left to decode.
    pub fn remaining(&self) -> usize {
        self.size.saturating_sub(self.off)
    }

    /// The encoded message: everything before the cursor.
    pub fn encoded(&self) -> &[u8] {
        &self.buf[..self.off]
    }

    /// A view of `[from, to)` of the underlying storage.
    pub fn slice(&self, from: usize, to: usize) -> &[u8] {
        &self.buf[from..to]
    }

    /// Encodes any XDR value at the cursor.
    pub fn encode<T: Serialize + ?Sized>(&mut self, val: &T) -> Result<()> {
        val.serialize(self).map_err(Error::from)
    }

    /// Decodes any XDR value at the cursor.
    pub fn decode<T: Deserialize + Default>(&mut self) -> Result<T> {
        deserialize::<T>(self).map_err(Error::decode)
    }

    pub fn put_int(&mut self, val: i32) -> Result<()> {
        self.encode(&val)
    }

    pub fn put_uint(&mut self, val: u32) -> Result<()> {
        self.encode(&val)
    }

    pub fn put_hyper(&mut self, val: i64) -> Result<()> {
        self.encode(&val)
    }

    pub fn put_uhyper(&mut self, val: u64) -> Result<()> {
        self.encode(&val)
    }

    pub fn put_bool(&mut self, val: bool) -> Result<()> {
        self.encode(&val)
    }

    pub fn put_float(&mut self, val: f32) -> Result<()> {
        self.encode(&val)
    }

    pub fn put_double(&mut self, val: f64) -> Result<()> {
        self.encode(&val)
    }

    /// Variable-length opaque data: length, bytes, padding.
    pub fn put_bytes(&mut self, val: &[u8]) -> Result<()> {
        self.encode(val)
    }

    /// Fixed-length opaque data: bytes and padding, no length.
    pub fn put_fixed(&mut self, val: &[u8]) -> Result<()> {
        self.write_all(val)?;
        utils::write_padding(val.len(), self)?;
        Ok(())
    }

    pub fn put_string(&mut self, val: &str) -> Result<()> {
        self.encode(val)
    }

    pub fn get_int(&mut self) -> Result<i32> {
        self.decode()
    }

    pub fn get_uint(&mut self) -> Result<u32> {
        self.decode()
    }

    pub fn get_hyper(&mut self) -> Result<i64> {
        self.decode()
    }

    pub fn get_uhyper(&mut self) -> Result<u64> {
        self.decode()
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        self.decode()
    }

    pub fn get_float(&mut self) -> Result<f32> {
        self.decode()
    }

    pub fn get_double(&mut self) -> Result<f64> {
        self.decode()
    }

    /// Variable-length opaque data. A zero-length array yields an empty
    /// vector and consumes only the length word.
    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        self.decode()
    }

    /// Fixed-length opaque data of `len` bytes plus padding.
    pub fn get_fixed(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut val = vec![0; len];
        self.read_exact(&mut val).map_err(Error::decode)?;
        utils::read_padding(len, self).map_err(Error::decode)?;
        Ok(val)
    }

    pub fn get_string(&mut self) -> Result<String> {
        self.decode()
    }

    /// Moves the cursor back to `from`, discarding what was encoded after it.
    pub(crate) fn rewind_to(&mut self, from: usize) {
        self.off = from;
    }

    /// Consumes the buffer and returns the encoded bytes.
    pub fn into_encoded(mut self) -> Vec<u8> {
        self.buf.truncate(self.off);
        self.buf
    }
}

impl Read for XdrBuffer {
    fn read(&mut self, dest: &mut [u8]) -> std::io::Result<usize> {
        let n = dest.len().min(self.remaining());
        dest[..n].copy_from_slice(&self.buf[self.off..self.off + n]);
        self.off += n;
        Ok(n)
    }
}

impl Write for XdrBuffer {
    fn write(&mut self, src: &[u8]) -> std::io::Result<usize> {
        if self.off + src.len() > self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!(
                    "XDR buffer overflow: {} bytes at offset {} exceed capacity {}",
                    src.len(),
                    self.off,
                    self.buf.len()
                ),
            ));
        }
        self.buf[self.off..self.off + src.len()].copy_from_slice(src);
        self.off += src.len();
        Ok(src.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for XdrBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XdrBuffer")
            .field("capacity", &self.buf.len())
            .field("offset", &self.off)
            .field("size", &self.size)
            .field("wrap_offset", &self.wrap_offset)
            .finish()
    }
}
