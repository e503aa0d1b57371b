//! OS signal handling.
//!
//! SIGINT and SIGTERM both request graceful shutdown: stop accepting HTTP
//! connections, drain the IOMgr pool, flush logs.

use tokio::signal::unix::{signal, SignalKind};

/// Waits for the first termination signal and returns its name.
pub async fn wait_for_termination() -> std::io::Result<&'static str> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    };
    Ok(name)
}
