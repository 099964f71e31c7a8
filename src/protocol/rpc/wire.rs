//! RPC record marking (RFC 5531 section 11).
//!
//! On a stream transport every RPC message is sent as a record made of one
//! or more fragments. Each fragment starts with a 4-byte big-endian header:
//! the highest bit marks the last fragment of the record and the lower 31
//! bits hold the fragment length. Datagram transports carry one message
//! per datagram and need no framing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::rpc::MAX_RPC_RECORD_LENGTH;

const LAST_FRAGMENT: u32 = 1 << 31;
/// Maximum fragment size is 2^31 - 1 bytes
const MAX_FRAGMENT_SIZE: usize = (1 << 31) - 1;

/// Reads one fragment and appends it to `append_to`.
///
/// Returns true if this was the last fragment of the record.
async fn read_fragment<R>(socket: &mut R, append_to: &mut Vec<u8>) -> Result<bool>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header_buf = [0_u8; 4];
    socket.read_exact(&mut header_buf).await?;
    let fragment_header = u32::from_be_bytes(header_buf);
    let is_last = (fragment_header & LAST_FRAGMENT) > 0;
    let length = (fragment_header & !LAST_FRAGMENT) as usize;
    trace!("Reading fragment length:{}, last:{}", length, is_last);
    if append_to.len().saturating_add(length) > MAX_RPC_RECORD_LENGTH {
        return Err(Error::Protocol(format!(
            "RPC record length {} exceeds max {}",
            append_to.len() + length,
            MAX_RPC_RECORD_LENGTH
        )));
    }
    let start_offset = append_to.len();
    append_to.resize(start_offset + length, 0);
    socket.read_exact(&mut append_to[start_offset..]).await?;
    Ok(is_last)
}

/// Reads fragments until a complete record has been reassembled.
pub async fn read_record<R>(socket: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut record = Vec::new();
    while !read_fragment(socket, &mut record).await? {}
    Ok(record)
}

/// Writes `buf` as one record, split into as many fragments as needed.
pub async fn write_fragment<W>(socket: &mut W, buf: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut offset = 0;
    loop {
        let fragment_size = std::cmp::min(buf.len() - offset, MAX_FRAGMENT_SIZE);
        let is_last = offset + fragment_size >= buf.len();
        let fragment_header =
            if is_last { fragment_size as u32 | LAST_FRAGMENT } else { fragment_size as u32 };

        trace!("Writing fragment length:{}, last:{}", fragment_size, is_last);
        socket.write_all(&fragment_header.to_be_bytes()).await?;
        socket.write_all(&buf[offset..offset + fragment_size]).await?;

        offset += fragment_size;
        if is_last {
            break;
        }
    }
    socket.flush().await?;

    Ok(())
}
