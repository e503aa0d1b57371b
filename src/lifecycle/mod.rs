//! Process lifecycle: signals and graceful shutdown.

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
