//! Bounded pool of IOMgr connections.
//!
//! # Responsibilities
//! - Cap concurrent IOMgr traffic at `max_conns` connections
//! - Hand out idle connections without blocking when one is available
//! - Grow speculatively up to the cap when the idle set is empty
//! - Discard invalidated connections and never re-enqueue them
//!
//! # Design Decisions
//! - The idle set is a bounded channel sized `max_conns`; acquire parks on it
//! - Growth is speculative, not a hard hand-off: the grower enqueues its
//!   connection and the parked caller takes whichever arrives first
//! - Slot accounting is a CAS loop on an atomic counter, so the cap holds
//!   under races without a lock around the dial

use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, Mutex};

use crate::iomgr::connection::Connection;
use crate::iomgr::error::PoolError;

/// Connections opened at startup.
pub const DEFAULT_MIN_CONNS: usize = 1;
/// Hard cap on concurrent IOMgr connections.
pub const DEFAULT_MAX_CONNS: usize = 8;

/// Address family used to dial the IOMgr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFamily {
    Tcp,
    Tcp6,
}

/// Everything the pool needs to dial and police its connections.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub host: String,
    pub port: u16,
    pub family: NetworkFamily,
    pub min_conns: usize,
    pub max_conns: usize,
    pub read_deadline: Duration,
    /// Ceiling applied by the request pipeline when forwarding bodies.
    pub max_json_payload_size: u64,
}

/// Bounded set of connections to one IOMgr instance.
#[derive(Debug)]
pub struct ConnPool {
    settings: PoolSettings,
    /// Connections created and not yet discarded; never exceeds `max_conns`.
    total: AtomicUsize,
    closed: AtomicBool,
    idle_tx: mpsc::Sender<Connection>,
    idle_rx: Mutex<mpsc::Receiver<Connection>>,
}

impl ConnPool {
    /// Creates the pool and pre-warms it with `min_conns` connections.
    pub async fn new(settings: PoolSettings) -> Result<Arc<Self>, PoolError> {
        if settings.min_conns < 1 || settings.min_conns > settings.max_conns {
            return Err(PoolError::InvalidBounds {
                min: settings.min_conns,
                max: settings.max_conns,
            });
        }

        let (idle_tx, idle_rx) = mpsc::channel(settings.max_conns);
        let pool = Arc::new(Self {
            settings,
            total: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
        });

        for _ in 0..pool.settings.min_conns {
            let conn = pool.create_conn().await?;
            // Channel capacity equals max_conns, so this cannot fail here.
            pool.idle_tx
                .try_send(conn)
                .map_err(|_| PoolError::Full(pool.settings.max_conns))?;
        }

        tracing::info!(
            host = %pool.settings.host,
            port = pool.settings.port,
            min = pool.settings.min_conns,
            max = pool.settings.max_conns,
            "IOMgr connection pool initialized"
        );
        Ok(pool)
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Connections currently accounted for (idle + handed out).
    pub fn total_count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Reserves a slot under the cap; CAS so concurrent growers never
    /// overshoot `max_conns`.
    fn try_reserve_slot(&self) -> bool {
        let mut current = self.total.load(Ordering::SeqCst);
        loop {
            if current >= self.settings.max_conns {
                return false;
            }
            match self.total.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release_slot(&self) {
        self.total.fetch_sub(1, Ordering::SeqCst);
    }

    async fn create_conn(&self) -> Result<Connection, PoolError> {
        if !self.try_reserve_slot() {
            return Err(PoolError::Full(self.settings.max_conns));
        }

        match self.dial().await {
            Ok(stream) => Ok(Connection::new(stream, self.settings.read_deadline)),
            Err(e) => {
                self.release_slot();
                Err(PoolError::Unreachable(e))
            }
        }
    }

    async fn dial(&self) -> Result<TcpStream, std::io::Error> {
        let target = (self.settings.host.as_str(), self.settings.port);
        let mut addrs = lookup_host(target).await?;
        let addr: Option<SocketAddr> = addrs.find(|a| match self.settings.family {
            NetworkFamily::Tcp => a.is_ipv4(),
            NetworkFamily::Tcp6 => a.is_ipv6(),
        });
        let addr = addr.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address of the requested family for {}", self.settings.host),
            )
        })?;
        TcpStream::connect(addr).await
    }

    /// Takes a connection from the pool.
    ///
    /// Fast path: an idle connection is returned immediately. Otherwise a
    /// background grower tries to add one connection (subject to the cap) and
    /// the caller parks on the idle channel until any connection arrives.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConn, PoolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        {
            let mut idle = self.idle_rx.lock().await;
            if let Ok(conn) = idle.try_recv() {
                return Ok(PooledConn::new(self.clone(), conn));
            }
        }

        let grower = self.clone();
        tokio::spawn(async move {
            match grower.create_conn().await {
                Ok(conn) => {
                    if grower.idle_tx.try_send(conn).is_err() {
                        grower.release_slot();
                    }
                }
                Err(PoolError::Full(_)) => {}
                Err(e) => tracing::debug!(error = %e, "speculative pool growth failed"),
            }
        });

        let mut idle = self.idle_rx.lock().await;
        match idle.recv().await {
            Some(conn) => Ok(PooledConn::new(self.clone(), conn)),
            None => Err(PoolError::Closed),
        }
    }

    /// Puts a connection back, or discards it if it can no longer be trusted.
    fn release(&self, conn: Connection) {
        if conn.is_invalidated() || self.closed.load(Ordering::SeqCst) {
            self.release_slot();
            tracing::debug!(total = self.total_count(), "discarding IOMgr connection");
            return;
        }
        if self.idle_tx.try_send(conn).is_err() {
            // Unreachable while total <= max_conns holds.
            self.release_slot();
            tracing::warn!("idle channel full on release, closing connection");
        }
    }

    /// Drains and closes every idle connection. Safe to call once at
    /// shutdown, after the HTTP listeners have stopped.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut idle = self.idle_rx.lock().await;
        while let Ok(conn) = idle.try_recv() {
            drop(conn);
            self.release_slot();
        }
        tracing::info!("IOMgr connection pool stopped");
    }
}

/// RAII guard for a pooled connection.
///
/// Dropping the guard returns the connection to the pool (or discards it when
/// invalidated), so every exit path of the request pipeline releases exactly
/// once.
#[derive(Debug)]
pub struct PooledConn {
    pool: Arc<ConnPool>,
    conn: Option<Connection>,
}

impl PooledConn {
    fn new(pool: Arc<ConnPool>, conn: Connection) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }
}

impl Deref for PooledConn {
    type Target = Connection;
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn sink_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut sink = [0u8; 1024];
                    while let Ok(n) = socket.read(&mut sink).await {
                        if n == 0 {
                            break;
                        }
                        let _ = socket.write_all(&sink[..n]).await;
                    }
                });
            }
        });
        (addr, handle)
    }

    fn settings(addr: SocketAddr, min: usize, max: usize) -> PoolSettings {
        PoolSettings {
            host: addr.ip().to_string(),
            port: addr.port(),
            family: NetworkFamily::Tcp,
            min_conns: min,
            max_conns: max,
            read_deadline: Duration::from_secs(5),
            max_json_payload_size: 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn rejects_invalid_bounds() {
        let (addr, _server) = sink_server().await;
        let err = ConnPool::new(settings(addr, 3, 2)).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidBounds { min: 3, max: 2 }));
    }

    #[tokio::test]
    async fn prewarms_min_connections() {
        let (addr, _server) = sink_server().await;
        let pool = ConnPool::new(settings(addr, 2, 4)).await.unwrap();
        assert_eq!(pool.total_count(), 2);
    }

    #[tokio::test]
    async fn total_never_exceeds_max() {
        let (addr, _server) = sink_server().await;
        let pool = ConnPool::new(settings(addr, 1, 3)).await.unwrap();

        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.acquire().await.unwrap());
        }
        assert!(pool.total_count() <= 3);
        drop(held);
        assert!(pool.total_count() <= 3);
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let (addr, _server) = sink_server().await;
        let pool = ConnPool::new(settings(addr, 1, 1)).await.unwrap();

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        let _conn = pool.acquire().await.unwrap();
        assert_eq!(pool.total_count(), 1);
    }

    #[tokio::test]
    async fn invalidated_connection_is_discarded() {
        let (addr, _server) = sink_server().await;
        let pool = ConnPool::new(settings(addr, 1, 2)).await.unwrap();
        assert_eq!(pool.total_count(), 1);

        let mut conn = pool.acquire().await.unwrap();
        conn.invalidate();
        drop(conn);
        assert_eq!(pool.total_count(), 0);

        // The pool recovers by dialing a fresh connection.
        let _conn = pool.acquire().await.unwrap();
        assert_eq!(pool.total_count(), 1);
    }

    #[tokio::test]
    async fn acquire_parks_until_release() {
        let (addr, _server) = sink_server().await;
        let pool = ConnPool::new(settings(addr, 1, 1)).await.unwrap();

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake after release")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_drains_idle() {
        let (addr, _server) = sink_server().await;
        let pool = ConnPool::new(settings(addr, 2, 4)).await.unwrap();
        pool.shutdown().await;
        assert_eq!(pool.total_count(), 0);
        assert!(matches!(pool.acquire().await.unwrap_err(), PoolError::Closed));
    }

    #[tokio::test]
    async fn unreachable_target_fails_startup() {
        // Bind-then-drop leaves a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = ConnPool::new(settings(addr, 1, 2)).await.unwrap_err();
        assert!(matches!(err, PoolError::Unreachable(_)), "got {err:?}");
    }
}
