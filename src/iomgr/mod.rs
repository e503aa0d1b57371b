//! Everything that talks to the IOMgr: framing, connections, pooling.

pub mod connection;
pub mod error;
pub mod framing;
pub mod pool;

pub use connection::Connection;
pub use error::{IoMgrError, PoolError};
pub use pool::{ConnPool, NetworkFamily, PoolSettings, PooledConn};
