//! Error taxonomy for the IOMgr side of the gateway.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while talking to the IOMgr over a pooled connection.
///
/// Every variant except [`IoMgrError::App`] is fatal for the connection it
/// occurred on: the connection is marked invalidated and the pool discards it
/// on release. `App` means the engine processed the request and answered with
/// an application-level status; the connection stays usable.
#[derive(Debug, Error)]
pub enum IoMgrError {
    /// Framing violation: varint overrun, message type or length mismatch,
    /// chunk-size overflow, request-ID mismatch, byte-accounting mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A blocking read exceeded the configured read deadline.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// The peer closed the stream before a complete varint arrived.
    #[error("unexpected end of stream")]
    EndOfStream,

    /// Inbound request body exceeded `iomgr.max_json_payload_size`.
    #[error("JSON payload is too large: received {received} bytes, but expecting at most {limit} bytes")]
    PayloadTooLarge { received: u64, limit: u64 },

    /// The engine answered with a non-empty message list.
    #[error("code: {code}, message: {text}")]
    App {
        /// `rest_status_code` from the paired response; 0 when absent.
        rest_status: u32,
        code: i32,
        text: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IoMgrError {
    /// Whether the error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, IoMgrError::App { .. })
    }
}

/// Errors raised by the connection pool itself.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid number of connections for the IOMgr connection pool: min {min}, max {max}")]
    InvalidBounds { min: usize, max: usize },

    /// The pool is at `max_conns` and no connection could be created.
    #[error("too many IOMgr connections, limit is {0}")]
    Full(usize),

    /// Dialing the IOMgr endpoint failed.
    #[error("can't create IOMgr connection: {0}")]
    Unreachable(#[source] std::io::Error),

    /// The pool has been shut down.
    #[error("IOMgr connection pool is closed")]
    Closed,
}
