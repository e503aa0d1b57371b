//! Instance configuration: file format, schema, units, validation.

pub mod loader;
pub mod schema;
pub mod units;
pub mod validation;

pub use loader::{ConfigError, ConfigFile};
pub use schema::{
    GatewayConfig, LogChannelConfig, LogChannelType, Severity, INSTANCE_CONFIG_ROOT,
};
pub use validation::{validate_config, ValidationError};

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Minimal scoped temp directory; the crate carries no tempfile
    /// dependency.
    pub struct TempDir(PathBuf);

    impl TempDir {
        pub fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    pub fn temp_dir(tag: &str) -> TempDir {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let unique = format!(
            "siodb-rest-{tag}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        );
        let path = std::env::temp_dir().join(unique);
        std::fs::create_dir_all(&path).unwrap();
        TempDir(path)
    }

    /// Writes a complete instance config file. `overrides` lines come first,
    /// and lookups return the first match, so they win over the defaults.
    pub fn write_instance_config(dir: &Path, overrides: &str) -> PathBuf {
        let defaults = "\
rest_server.ipv4_http_port = 50080
rest_server.ipv4_https_port = 0
rest_server.ipv6_http_port = 0
rest_server.ipv6_https_port = 0
rest_server.chunk_size = 64k
rest_server.request_payload_buffer_size = 1k
rest_server.iomgr_read_timeout = 30
iomgr.rest.ipv4_port = 50002
iomgr.rest.ipv6_port = 0
iomgr.max_json_payload_size = 1m
log_channels = console
log.console.type = console
log.console.destination = stdout
";
        let path = dir.join("config");
        std::fs::write(&path, format!("{overrides}{defaults}")).unwrap();
        path
    }
}
