//! Length-delimited framing over the IOMgr byte stream.
//!
//! # Responsibilities
//! - Encode/decode LEB128 unsigned varints
//! - Write/read framed protobuf messages: `varint(type) || varint(len) || body`
//! - Write/read length-prefixed payload chunks, zero chunk terminates
//!
//! All read operations take the caller's read deadline and apply it to every
//! blocking read, so a stalled IOMgr cannot park a request forever. Varints
//! are read one byte at a time to avoid consuming past the frame boundary.

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::BytesMut;
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::iomgr::error::IoMgrError;

/// Message type ID of a `RestRequest` frame.
pub const REQUEST_TYPE_ID: u64 = 13;
/// Message type ID of a `Response` frame.
pub const RESPONSE_TYPE_ID: u64 = 4;

/// Longest legal varint encoding of a u32.
pub const MAX_VARINT_LEN32: usize = 5;
/// Longest legal varint encoding of a u64.
pub const MAX_VARINT_LEN64: usize = 10;

/// Upper bound on a framed message body.
pub const MESSAGE_LENGTH_MAX: u32 = 1024 * 1024;
/// Upper bound on a single payload chunk.
pub const CHUNK_MAX: u32 = 2 * 1024 * 1024 * 1024 - 1;

/// Runs one blocking read under the connection's deadline.
async fn timed<T, F>(deadline: Duration, fut: F) -> Result<T, IoMgrError>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(IoMgrError::Io(e)),
        Err(_) => Err(IoMgrError::Timeout(deadline)),
    }
}

/// Appends the LEB128 encoding of `value` to `buf`.
pub fn encode_varint(value: u64, buf: &mut BytesMut) {
    prost::encoding::encode_varint(value, buf);
}

/// Reads one varint, at most `max_len` bytes long.
///
/// Returns `(bytes_consumed, value)`. Fails with [`IoMgrError::EndOfStream`]
/// if the stream ends before the first byte, and with a protocol error if the
/// varint does not terminate within `max_len` bytes.
pub async fn read_varint<R>(
    stream: &mut R,
    max_len: usize,
    deadline: Duration,
) -> Result<(usize, u64), IoMgrError>
where
    R: AsyncRead + Unpin,
{
    let mut value: u64 = 0;
    let mut consumed = 0usize;
    loop {
        if consumed >= max_len {
            return Err(IoMgrError::Protocol(format!(
                "invalid varint (longer than {max_len} bytes) encountered"
            )));
        }
        let byte = match timed(deadline, stream.read_u8()).await {
            Ok(b) => b,
            Err(IoMgrError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof && consumed == 0 => {
                return Err(IoMgrError::EndOfStream);
            }
            Err(e) => return Err(e),
        };
        value |= u64::from(byte & 0x7f) << (7 * consumed);
        consumed += 1;
        if byte & 0x80 == 0 {
            return Ok((consumed, value));
        }
    }
}

/// Reads exactly `buf.len()` bytes, each read bounded by `deadline`.
pub async fn read_exact_timed<R>(
    stream: &mut R,
    buf: &mut [u8],
    deadline: Duration,
) -> Result<(), IoMgrError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = timed(deadline, stream.read(&mut buf[filled..])).await?;
        if n == 0 {
            return Err(IoMgrError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed mid-frame",
            )));
        }
        filled += n;
    }
    Ok(())
}

/// Writes one framed protobuf message and returns the byte count put on the
/// wire. The frame is assembled in memory first so a partial header is never
/// emitted.
pub async fn write_message<W, M>(
    stream: &mut W,
    type_id: u64,
    message: &M,
) -> Result<usize, IoMgrError>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let body_len = message.encoded_len();
    let mut frame = BytesMut::with_capacity(2 * MAX_VARINT_LEN32 + body_len);
    encode_varint(type_id, &mut frame);
    encode_varint(body_len as u64, &mut frame);
    message
        .encode(&mut frame)
        .map_err(|e| IoMgrError::Protocol(format!("unable to encode message: {e}")))?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(frame.len())
}

/// Reads one framed protobuf message of the expected type.
pub async fn read_message<R, M>(
    stream: &mut R,
    expected_type_id: u64,
    deadline: Duration,
) -> Result<M, IoMgrError>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    let (_, type_id) = read_varint(stream, MAX_VARINT_LEN32, deadline).await?;
    if type_id != expected_type_id {
        return Err(IoMgrError::Protocol(format!(
            "unexpected message type {type_id}, expecting {expected_type_id}"
        )));
    }

    let (_, message_length) = read_varint(stream, MAX_VARINT_LEN32, deadline).await?;
    if message_length > u64::from(MESSAGE_LENGTH_MAX) {
        return Err(IoMgrError::Protocol(format!(
            "message length received ({message_length}) bigger than allowed ({MESSAGE_LENGTH_MAX})"
        )));
    }

    let mut body = vec![0u8; message_length as usize];
    read_exact_timed(stream, &mut body, deadline).await?;
    M::decode(body.as_slice())
        .map_err(|e| IoMgrError::Protocol(format!("unable to decode message: {e}")))
}

/// Writes one payload chunk: `varint(len) || data`. An empty `data` emits the
/// zero-length terminator. Returns the bytes put on the wire.
pub async fn write_chunk<W>(stream: &mut W, data: &[u8]) -> Result<u64, IoMgrError>
where
    W: AsyncWrite + Unpin,
{
    let mut header = BytesMut::with_capacity(MAX_VARINT_LEN32);
    encode_varint(data.len() as u64, &mut header);
    stream.write_all(&header).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    Ok(header.len() as u64 + data.len() as u64)
}

/// Reads the next chunk-size varint; zero means end of stream.
pub async fn read_chunk_size<R>(stream: &mut R, deadline: Duration) -> Result<u32, IoMgrError>
where
    R: AsyncRead + Unpin,
{
    let (_, size) = read_varint(stream, MAX_VARINT_LEN32, deadline).await?;
    if size > u64::from(CHUNK_MAX) {
        return Err(IoMgrError::Protocol(format!(
            "chunk size received ({size}) bigger than allowed ({CHUNK_MAX})"
        )));
    }
    Ok(size as u32)
}
