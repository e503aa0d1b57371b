//! Siodb REST server.
//!
//! # Architecture Overview
//!
//! ```text
//!   Client Request          ┌──────────────────────────────────────────────┐
//!   ─────────────────────── ▶  http listeners (ipv4/ipv6 × http/https)     │
//!                           │        │                                     │
//!                           │        ▼                                     │
//!                           │  request pipeline (auth, framing, streaming) │
//!                           │        │                                     │
//!                           │        ▼                                     │
//!                           │  IOMgr connection pool ──────────────────────┼──▶ IOMgr
//!                           │                                              │
//!                           │  config / logging / lifecycle                │
//!   Client Response  ◀──────┴──────────────────────────────────────────────┘
//! ```
//!
//! Startup order matters: configuration first (exit code 2 on failure),
//! then logging, then the connection pool, then the listeners. SIGINT and
//! SIGTERM drain everything gracefully.

use std::path::Path;
use std::process;
use std::sync::Arc;

use clap::Parser;

use siodb_rest::config::{validate_config, GatewayConfig, INSTANCE_CONFIG_ROOT};
use siodb_rest::iomgr::pool::ConnPool;
use siodb_rest::lifecycle::{signals, Shutdown};
use siodb_rest::observability::logging;
use siodb_rest::HttpServer;

#[derive(Parser)]
#[command(name = "siodb_rest_server")]
#[command(about = "Siodb REST server", long_about = None)]
struct Cli {
    /// Instance name; configuration is read from
    /// /etc/siodb/instances/<name>/config.
    #[arg(long)]
    instance: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let Some(instance) = cli.instance.filter(|name| !name.is_empty()) else {
        eprintln!("fatal: invalid instance name in argument '--instance'");
        process::exit(1);
    };

    let instance_dir = Path::new(INSTANCE_CONFIG_ROOT).join(&instance);
    let config = match GatewayConfig::load(&instance_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            process::exit(2);
        }
    };
    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            eprintln!("fatal: {error}");
        }
        process::exit(2);
    }

    if let Err(e) = logging::init(&config.log_channels) {
        eprintln!("fatal: {e}");
        process::exit(2);
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        instance = %instance,
        "Siodb REST server starting"
    );

    let pool = match ConnPool::new(config.pool_settings()).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "can't create IOMgr connection pool");
            process::exit(2);
        }
    };

    let shutdown = Arc::new(Shutdown::new());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match signals::wait_for_termination().await {
                Ok(signal) => tracing::info!(signal, "signal received, terminating"),
                Err(e) => tracing::error!(error = %e, "signal handler failed"),
            }
            shutdown.trigger();
        });
    }

    let server = HttpServer::new(Arc::new(config), pool.clone());
    if let Err(e) = server.run(&shutdown).await {
        tracing::error!(error = %e, "HTTP server failed");
    }

    pool.shutdown().await;
    tracing::info!("shutdown complete");
}
