//! Siodb REST gateway library.
//!
//! A REST-to-binary-protocol gateway in front of the Siodb I/O manager
//! (IOMgr). HTTP requests against the resource hierarchy (databases, tables,
//! rows, ad-hoc SQL) are authenticated, translated into length-prefixed
//! protobuf frames on a pooled TCP connection, and the engine's chunked JSON
//! answer is streamed back to the client byte for byte.

// Core subsystems
pub mod config;
pub mod http;
pub mod iomgr;
pub mod proto;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::GatewayConfig;
pub use http::HttpServer;
pub use iomgr::ConnPool;
pub use lifecycle::Shutdown;
