//! A single IOMgr connection and its request/response discipline.
//!
//! # Responsibilities
//! - Own the byte stream plus the per-connection request counter
//! - Frame requests and responses, matching response request IDs
//! - Stream JSON payloads in both directions with strict byte accounting
//! - Mark itself invalidated on any protocol violation, timeout or I/O error
//!
//! # State Machine
//! ```text
//! FRESH ──send_request──▶ AWAITING_RESPONSE ──recv_response──▶ STREAMING ──▶ DONE
//!   any state ──io_error | timeout | protocol violation──▶ INVALIDATED (terminal)
//! ```
//!
//! The request counter lives here and nowhere else: it is the sequence number
//! of the framed protocol, so it must follow the stream, not the worker.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::iomgr::error::IoMgrError;
use crate::iomgr::framing::{
    read_chunk_size, read_exact_timed, read_message, write_chunk, write_message, REQUEST_TYPE_ID,
    RESPONSE_TYPE_ID,
};
use crate::proto::{DatabaseObjectType, Response, RestRequest, RestVerb};

/// Chunks of the response body handed to the HTTP layer.
pub type HttpChunkSender = mpsc::Sender<Result<Bytes, io::Error>>;

/// One live connection to the IOMgr.
///
/// Generic over the stream type so tests can drive it over an in-memory
/// duplex pipe; production code uses [`TcpStream`].
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: S,
    /// Next request ID to hand out; starts at 1 and never repeats.
    request_id: u64,
    read_deadline: Duration,
    invalidated: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, read_deadline: Duration) -> Self {
        Self {
            stream,
            request_id: 1,
            read_deadline,
            invalidated: false,
        }
    }

    /// Returns the current request ID and advances the counter.
    fn next_request_id(&mut self) -> u64 {
        let id = self.request_id;
        self.request_id += 1;
        id
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Marks the connection unusable; the pool will discard it on release.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    fn fatal<T>(&mut self, result: Result<T, IoMgrError>) -> Result<T, IoMgrError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.invalidated = true;
            }
        }
        result
    }

    /// Builds and sends one `RestRequest` frame; returns the request ID it
    /// was stamped with.
    pub async fn send_request(
        &mut self,
        verb: RestVerb,
        object_type: DatabaseObjectType,
        user_name: &str,
        token: &str,
        object_name: &str,
        object_id: u64,
    ) -> Result<u64, IoMgrError> {
        let request_id = self.next_request_id();
        let request = RestRequest {
            request_id,
            verb: verb as i32,
            object_type: object_type as i32,
            user_name: user_name.to_owned(),
            token: token.to_owned(),
            object_name: (!object_name.is_empty()).then(|| object_name.to_owned()),
            object_id: (object_id > 0).then_some(object_id),
        };

        tracing::debug!(request_id, ?verb, ?object_type, object_name, "sending IOMgr request");
        let result = write_message(&mut self.stream, REQUEST_TYPE_ID, &request)
            .await
            .map(|_| request_id);
        self.fatal(result)
    }

    /// Reads one `Response` frame and pairs it with `expected_request_id`.
    ///
    /// A non-empty message list comes back as [`IoMgrError::App`]; the
    /// connection itself stays healthy in that case. Everything else that can
    /// go wrong here is fatal.
    pub async fn recv_response(&mut self, expected_request_id: u64) -> Result<u32, IoMgrError> {
        let deadline = self.read_deadline;
        let result = read_message::<_, Response>(&mut self.stream, RESPONSE_TYPE_ID, deadline).await;
        let response = self.fatal(result)?;

        if response.request_id != expected_request_id {
            self.invalidated = true;
            return Err(IoMgrError::Protocol(format!(
                "request IDs mismatch: sent {expected_request_id}, received {}",
                response.request_id
            )));
        }

        if let Some(status) = response.message.first() {
            return Err(IoMgrError::App {
                rest_status: response.rest_status_code,
                code: status.status_code,
                text: status.text.clone(),
            });
        }

        Ok(response.rest_status_code)
    }

    /// Forwards the HTTP request body to the IOMgr as a chunk stream.
    ///
    /// The body is never buffered whole: it is repacked into blocks of
    /// `buffer_size` bytes, each block written as one chunk, followed by the
    /// zero-length terminator. Exceeding `max_payload_bytes` aborts the
    /// stream and invalidates the connection. Returns the payload bytes
    /// forwarded (chunk headers and terminator excluded).
    pub async fn stream_body_to_peer<B, E>(
        &mut self,
        mut body: B,
        max_payload_bytes: u64,
        buffer_size: usize,
    ) -> Result<u64, IoMgrError>
    where
        B: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let mut buffer = BytesMut::with_capacity(buffer_size);
        let mut read_total: u64 = 0;
        let mut written_total: u64 = 0;

        while let Some(block) = body.next().await {
            let mut block = match block {
                Ok(block) => block,
                Err(e) => {
                    self.invalidated = true;
                    return Err(IoMgrError::Io(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        format!("request body read failed: {e}"),
                    )));
                }
            };

            read_total += block.len() as u64;
            if read_total > max_payload_bytes {
                self.invalidated = true;
                return Err(IoMgrError::PayloadTooLarge {
                    received: read_total,
                    limit: max_payload_bytes,
                });
            }

            while !block.is_empty() {
                let take = (buffer_size - buffer.len()).min(block.len());
                buffer.extend_from_slice(&block.split_to(take));
                if buffer.len() == buffer_size {
                    let result = write_chunk(&mut self.stream, &buffer).await;
                    self.fatal(result)?;
                    written_total += buffer.len() as u64;
                    buffer.clear();
                }
            }
        }

        if !buffer.is_empty() {
            let result = write_chunk(&mut self.stream, &buffer).await;
            self.fatal(result)?;
            written_total += buffer.len() as u64;
        }

        let result = write_chunk(&mut self.stream, &[]).await;
        self.fatal(result)?;
        let result = self.stream.flush().await.map_err(IoMgrError::Io);
        self.fatal(result)?;

        tracing::debug!(read_total, written_total, "request payload forwarded");
        Ok(written_total)
    }

    /// Streams the IOMgr's chunked response body to the HTTP layer.
    ///
    /// Pure event loop: read a chunk size, read that many bytes into the
    /// repacking buffer, flush a full HTTP block of `http_chunk_size` bytes,
    /// stop on the zero chunk. The residual tail is flushed at the end, and
    /// bytes read must equal bytes written or the connection is invalidated.
    pub async fn stream_body_from_peer(
        &mut self,
        out: &mut HttpChunkSender,
        http_chunk_size: usize,
    ) -> Result<u64, IoMgrError> {
        let deadline = self.read_deadline;
        let mut buffer = BytesMut::with_capacity(http_chunk_size);
        let mut read_total: u64 = 0;
        let mut written_total: u64 = 0;

        loop {
            let result = read_chunk_size(&mut self.stream, deadline).await;
            let chunk_size = self.fatal(result)?;
            if chunk_size == 0 {
                break;
            }

            let mut remaining = chunk_size as usize;
            while remaining > 0 {
                let want = (http_chunk_size - buffer.len()).min(remaining);
                let start = buffer.len();
                buffer.resize(start + want, 0);
                let result = read_exact_timed(&mut self.stream, &mut buffer[start..], deadline).await;
                self.fatal(result)?;
                read_total += want as u64;
                remaining -= want;

                if buffer.len() == http_chunk_size {
                    written_total += self.flush_http_block(out, &mut buffer).await?;
                }
            }
        }

        if !buffer.is_empty() {
            written_total += self.flush_http_block(out, &mut buffer).await?;
        }

        if read_total != written_total {
            self.invalidated = true;
            return Err(IoMgrError::Protocol(format!(
                "byte accounting mismatch: read {read_total}, written {written_total}"
            )));
        }

        tracing::debug!(read_total, written_total, "response payload streamed");
        Ok(written_total)
    }

    async fn flush_http_block(
        &mut self,
        out: &mut HttpChunkSender,
        buffer: &mut BytesMut,
    ) -> Result<u64, IoMgrError> {
        let block = buffer.split().freeze();
        let len = block.len() as u64;
        if out.send(Ok(block)).await.is_err() {
            // Receiver gone means the HTTP client hung up mid-response; the
            // rest of the chunk stream is stranded on this connection.
            self.invalidated = true;
            return Err(IoMgrError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "HTTP client disconnected",
            )));
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iomgr::framing::{encode_varint, CHUNK_MAX};
    use crate::proto::StatusMessage;
    use futures::stream;
    use tokio::io::DuplexStream;

    const DEADLINE: Duration = Duration::from_secs(5);

    fn pair() -> (Connection<DuplexStream>, DuplexStream) {
        let (near, far) = tokio::io::duplex(1 << 20);
        (Connection::new(near, DEADLINE), far)
    }

    async fn reply(far: &mut DuplexStream, response: &Response) {
        write_message(far, RESPONSE_TYPE_ID, response).await.unwrap();
    }

    #[tokio::test]
    async fn request_ids_are_monotonic() {
        let (mut conn, mut far) = pair();

        for expected in 1u64..=3 {
            let id = conn
                .send_request(RestVerb::Get, DatabaseObjectType::Database, "u", "t", "", 0)
                .await
                .unwrap();
            assert_eq!(id, expected);

            let request: RestRequest = read_message(&mut far, REQUEST_TYPE_ID, DEADLINE)
                .await
                .unwrap();
            assert_eq!(request.request_id, expected);
        }
    }

    #[tokio::test]
    async fn empty_object_name_and_zero_id_are_omitted() {
        let (mut conn, mut far) = pair();
        conn.send_request(RestVerb::Get, DatabaseObjectType::Database, "u", "t", "", 0)
            .await
            .unwrap();

        let request: RestRequest = read_message(&mut far, REQUEST_TYPE_ID, DEADLINE)
            .await
            .unwrap();
        assert_eq!(request.object_name, None);
        assert_eq!(request.object_id, None);
    }

    #[tokio::test]
    async fn matching_response_returns_status() {
        let (mut conn, mut far) = pair();
        let id = conn
            .send_request(RestVerb::Get, DatabaseObjectType::Row, "u", "t", "db.t", 42)
            .await
            .unwrap();

        reply(
            &mut far,
            &Response {
                request_id: id,
                rest_status_code: 200,
                message: vec![],
            },
        )
        .await;

        assert_eq!(conn.recv_response(id).await.unwrap(), 200);
        assert!(!conn.is_invalidated());
    }

    #[tokio::test]
    async fn request_id_mismatch_invalidates() {
        let (mut conn, mut far) = pair();
        let id = conn
            .send_request(RestVerb::Get, DatabaseObjectType::Row, "u", "t", "db.t", 1)
            .await
            .unwrap();

        reply(
            &mut far,
            &Response {
                request_id: 999,
                rest_status_code: 200,
                message: vec![],
            },
        )
        .await;

        let err = conn.recv_response(id).await.unwrap_err();
        assert!(matches!(err, IoMgrError::Protocol(ref m) if m.contains("request IDs mismatch")));
        assert!(conn.is_invalidated());
    }

    #[tokio::test]
    async fn app_error_leaves_connection_healthy() {
        let (mut conn, mut far) = pair();
        let id = conn
            .send_request(RestVerb::Get, DatabaseObjectType::Table, "u", "t", "nosuch", 0)
            .await
            .unwrap();

        reply(
            &mut far,
            &Response {
                request_id: id,
                rest_status_code: 404,
                message: vec![StatusMessage {
                    status_code: 2015,
                    text: "Database doesn't exist".into(),
                }],
            },
        )
        .await;

        match conn.recv_response(id).await.unwrap_err() {
            IoMgrError::App { rest_status, code, text } => {
                assert_eq!(rest_status, 404);
                assert_eq!(code, 2015);
                assert_eq!(text, "Database doesn't exist");
            }
            other => panic!("expected App error, got {other:?}"),
        }
        assert!(!conn.is_invalidated());
    }

    #[tokio::test]
    async fn body_forwarding_repacks_into_buffer_sized_chunks() {
        let (mut conn, mut far) = pair();

        // 10 bytes through a 4-byte forward buffer: chunks of 4, 4, 2.
        let body = stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"0123")),
            Ok(Bytes::from_static(b"456")),
            Ok(Bytes::from_static(b"789")),
        ]);
        let written = conn.stream_body_to_peer(body, 1024, 4).await.unwrap();
        assert_eq!(written, 10);

        let mut sizes = Vec::new();
        let mut payload = Vec::new();
        loop {
            let size = read_chunk_size(&mut far, DEADLINE).await.unwrap();
            if size == 0 {
                break;
            }
            sizes.push(size as usize);
            let mut block = vec![0u8; size as usize];
            read_exact_timed(&mut far, &mut block, DEADLINE).await.unwrap();
            payload.extend_from_slice(&block);
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(payload, b"0123456789");
        assert!(!conn.is_invalidated());
    }

    #[tokio::test]
    async fn body_at_exact_limit_passes_one_byte_more_fails() {
        let (mut conn, _far) = pair();
        let body = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(vec![0u8; 1024]))]);
        conn.stream_body_to_peer(body, 1024, 512).await.unwrap();
        assert!(!conn.is_invalidated());

        let (mut conn, _far) = pair();
        let body = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(vec![0u8; 1025]))]);
        let err = conn.stream_body_to_peer(body, 1024, 512).await.unwrap_err();
        assert!(matches!(err, IoMgrError::PayloadTooLarge { received: 1025, limit: 1024 }));
        assert!(conn.is_invalidated());
    }

    #[tokio::test]
    async fn response_streaming_conserves_bytes() {
        let (mut conn, mut far) = pair();

        // Uneven incoming chunks, repacked into 4-byte HTTP blocks.
        tokio::spawn(async move {
            write_chunk(&mut far, b"abcdefg").await.unwrap();
            write_chunk(&mut far, b"hi").await.unwrap();
            write_chunk(&mut far, b"jklmn").await.unwrap();
            write_chunk(&mut far, b"").await.unwrap();
        });

        let (mut tx, mut rx) = mpsc::channel::<Result<Bytes, io::Error>>(16);
        let written = conn.stream_body_from_peer(&mut tx, 4).await.unwrap();
        drop(tx);

        let mut blocks = Vec::new();
        while let Some(block) = rx.next().await {
            blocks.push(block.unwrap());
        }
        let total: usize = blocks.iter().map(|b| b.len()).sum();
        assert_eq!(written, 14);
        assert_eq!(total, 14);
        // Every block but the tail is exactly the HTTP chunk size.
        for block in &blocks[..blocks.len() - 1] {
            assert_eq!(block.len(), 4);
        }
        let joined: Vec<u8> = blocks.concat();
        assert_eq!(&joined, b"abcdefghijklmn");
        assert!(!conn.is_invalidated());
    }

    #[tokio::test]
    async fn client_disconnect_invalidates() {
        let (mut conn, mut far) = pair();
        tokio::spawn(async move {
            write_chunk(&mut far, &[0u8; 64]).await.unwrap();
            write_chunk(&mut far, b"").await.unwrap();
        });

        let (mut tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(0);
        drop(rx);
        let err = conn.stream_body_from_peer(&mut tx, 16).await.unwrap_err();
        assert!(matches!(err, IoMgrError::Io(_)), "got {err:?}");
        assert!(conn.is_invalidated());
    }

    #[tokio::test]
    async fn oversized_chunk_header_invalidates() {
        let (mut conn, mut far) = pair();
        let mut header = BytesMut::new();
        encode_varint(u64::from(CHUNK_MAX) + 1, &mut header);
        tokio::io::AsyncWriteExt::write_all(&mut far, &header)
            .await
            .unwrap();

        let (mut tx, _rx) = mpsc::channel::<Result<Bytes, io::Error>>(4);
        let err = conn.stream_body_from_peer(&mut tx, 16).await.unwrap_err();
        assert!(matches!(err, IoMgrError::Protocol(_)), "got {err:?}");
        assert!(conn.is_invalidated());
    }

    #[tokio::test]
    async fn send_failure_invalidates() {
        let (mut conn, far) = pair();
        drop(far);

        let err = conn
            .send_request(RestVerb::Get, DatabaseObjectType::Database, "u", "t", "", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, IoMgrError::Io(_)), "got {err:?}");
        assert!(conn.is_invalidated());
    }
}
