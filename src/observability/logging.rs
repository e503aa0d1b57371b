//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber from the instance log channels
//! - Map each configured channel to its own layer with its own severity
//! - Console channels write to stdout/stderr, file channels to a fresh
//!   timestamped log file under the configured directory
//!
//! Log file rotation by size or age is handled by the operations tooling
//! around the instance; the gateway only honors destination and severity.

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer, Registry};

use crate::config::{ConfigError, LogChannelConfig, LogChannelType, Severity};

fn level_filter(severity: Severity) -> LevelFilter {
    match severity {
        Severity::Trace => LevelFilter::TRACE,
        Severity::Debug => LevelFilter::DEBUG,
        Severity::Info => LevelFilter::INFO,
        Severity::Warning => LevelFilter::WARN,
        // tracing has no level above ERROR; fatal conditions exit anyway.
        Severity::Error | Severity::Fatal => LevelFilter::ERROR,
    }
}

fn create_log_file(directory: &str) -> Result<File, ConfigError> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let path = PathBuf::from(directory).join(format!(
        "rest_{seconds}_{pid}.log",
        pid = std::process::id()
    ));
    File::create(&path).map_err(|source| ConfigError::Io { path, source })
}

/// Initializes the global tracing subscriber with one layer per configured
/// log channel. Must be called once, before anything logs.
pub fn init(channels: &[LogChannelConfig]) -> Result<(), ConfigError> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    for channel in channels {
        let filter = level_filter(channel.severity);
        let layer = match channel.channel_type {
            LogChannelType::Console => {
                if channel.destination == "stderr" {
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(io::stderr as fn() -> io::Stderr)
                        .with_filter(filter)
                        .boxed()
                } else {
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(io::stdout as fn() -> io::Stdout)
                        .with_filter(filter)
                        .boxed()
                }
            }
            LogChannelType::File => {
                let file = create_log_file(&channel.destination)?;
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(filter)
                    .boxed()
            }
        };
        layers.push(layer);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| ConfigError::Validation(format!("can't initialize logging: {e}")))
}
