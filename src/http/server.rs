//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Build the axum Router mapping the REST surface onto the pipeline
//! - Attach CORS headers and request tracing to every response
//! - Run one listener per enabled port (ipv4/ipv6 × http/https)
//! - Terminate TLS for the HTTPS listeners
//! - Wind everything down on the shutdown signal

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderValue, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::http::handlers;
use crate::http::tls;
use crate::iomgr::pool::ConnPool;
use crate::lifecycle::Shutdown;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<ConnPool>,
    pub http_chunk_size: usize,
    pub request_payload_buffer_size: usize,
    pub max_json_payload_size: u64,
}

impl AppState {
    fn from_config(config: &GatewayConfig, pool: Arc<ConnPool>) -> Self {
        Self {
            pool,
            http_chunk_size: config.http_chunk_size as usize,
            request_payload_buffer_size: config.request_payload_buffer_size as usize,
            max_json_payload_size: u64::from(config.max_json_payload_size),
        }
    }
}

/// Attaches the CORS headers every response carries.
async fn cors_headers(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert(
        "Access-Control-Allow-Credentials",
        HeaderValue::from_static("true"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET,POST,PATCH,PUT,DELETE"),
    );
    response
}

/// HTTP server for the REST gateway.
pub struct HttpServer {
    config: Arc<GatewayConfig>,
    router: Router,
}

impl HttpServer {
    pub fn new(config: Arc<GatewayConfig>, pool: Arc<ConnPool>) -> Self {
        let state = AppState::from_config(&config, pool);
        let router = Self::build_router(state);
        Self { config, router }
    }

    /// The REST surface; also used directly by the integration tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/databases", get(handlers::get_databases))
            .route(
                "/databases/{database_name}/tables",
                get(handlers::get_tables),
            )
            .route(
                "/databases/{database_name}/tables/{table_name}/rows",
                get(handlers::get_rows).post(handlers::post_rows),
            )
            .route(
                "/databases/{database_name}/tables/{table_name}/rows/{row_id}",
                get(handlers::get_row)
                    .put(handlers::patch_row)
                    .patch(handlers::patch_row)
                    .delete(handlers::delete_row),
            )
            .route("/query", get(handlers::get_query))
            .with_state(state)
            .layer(middleware::from_fn(cors_headers))
            .layer(TraceLayer::new_for_http())
    }

    /// Runs every enabled listener until shutdown is triggered.
    pub async fn run(&self, shutdown: &Shutdown) -> io::Result<()> {
        let mut listeners = JoinSet::new();
        let v4: IpAddr = Ipv4Addr::UNSPECIFIED.into();
        let v6: IpAddr = Ipv6Addr::UNSPECIFIED.into();

        let acceptor = if self.config.https_enabled() {
            let certificate = self.config.tls_certificate.as_deref().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "TLS certificate not configured")
            })?;
            let private_key = self.config.tls_private_key.as_deref().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "TLS private key not configured")
            })?;
            Some(
                tls::build_acceptor(certificate, private_key)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?,
            )
        } else {
            None
        };

        for (address, port) in [(v4, self.config.ipv4_http_port), (v6, self.config.ipv6_http_port)]
        {
            if port == 0 {
                continue;
            }
            let listener = TcpListener::bind(SocketAddr::new(address, port)).await?;
            tracing::info!(address = %listener.local_addr()?, "HTTP listener bound");
            let router = self.router.clone();
            let wait = shutdown.wait();
            listeners.spawn(async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(wait)
                    .await
            });
        }

        for (address, port) in
            [(v4, self.config.ipv4_https_port), (v6, self.config.ipv6_https_port)]
        {
            if port == 0 {
                continue;
            }
            let acceptor = acceptor.clone().expect("validated at startup");
            let listener = TcpListener::bind(SocketAddr::new(address, port)).await?;
            tracing::info!(address = %listener.local_addr()?, "HTTPS listener bound");
            let router = self.router.clone();
            let mut stop = shutdown.subscribe();
            listeners.spawn(async move { serve_tls(listener, acceptor, router, &mut stop).await });
        }

        if listeners.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "all rest_server listener ports are disabled",
            ));
        }

        while let Some(result) = listeners.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "listener failed"),
                Err(e) => tracing::error!(error = %e, "listener task panicked"),
            }
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Accept loop for one HTTPS listener: TLS handshake per connection, then
/// hand the stream to hyper with the shared router.
async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    stop: &mut tokio::sync::broadcast::Receiver<()>,
) -> io::Result<()> {
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = stop.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(router.clone());
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    let builder = auto::Builder::new(TokioExecutor::new());
                    if let Err(e) = builder
                        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                        .await
                    {
                        tracing::debug!(peer = %peer_addr, error = %e, "connection closed with error");
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                }
            }
        });
    }
    Ok(())
}
