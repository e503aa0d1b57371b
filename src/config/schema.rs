//! Gateway configuration schema.
//!
//! The complete set of instance parameters the REST server consumes, parsed
//! from the flat parameter file into typed values. Range validation lives in
//! [`crate::config::validation`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::config::loader::{ConfigError, ConfigFile};
use crate::config::units::{parse_byte_size, parse_port, parse_seconds};
use crate::iomgr::pool::{NetworkFamily, PoolSettings, DEFAULT_MAX_CONNS, DEFAULT_MIN_CONNS};

/// Root of all instance configuration directories.
pub const INSTANCE_CONFIG_ROOT: &str = "/etc/siodb/instances";

pub const HTTP_CHUNK_SIZE_MIN: u32 = 1024;
pub const HTTP_CHUNK_SIZE_MAX: u32 = 1024 * 1024;
pub const REQUEST_PAYLOAD_BUFFER_MIN: u32 = 1024;
pub const REQUEST_PAYLOAD_BUFFER_MAX: u32 = 10 * 1024 * 1024;
pub const JSON_PAYLOAD_MIN: u32 = 1024;
pub const JSON_PAYLOAD_MAX: u32 = 10 * 1024 * 1024;
pub const READ_DEADLINE_MIN_SECS: u64 = 5;
pub const READ_DEADLINE_MAX_SECS: u64 = 60;
pub const LOG_FILE_SIZE_MIN: u32 = 1024 * 1024;
pub const LOG_FILE_EXP_TIME_MIN_SECS: u64 = 60;

/// Log channel sink kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogChannelType {
    Console,
    File,
}

impl FromStr for LogChannelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" => Ok(LogChannelType::Console),
            "file" => Ok(LogChannelType::File),
            other => Err(format!("unknown log channel type '{other}'")),
        }
    }
}

/// Log severity threshold, ordered from chattiest to quietest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Severity::Trace),
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "fatal" => Ok(Severity::Fatal),
            other => Err(format!("invalid severity level '{other}'")),
        }
    }
}

/// One configured log sink.
#[derive(Debug, Clone)]
pub struct LogChannelConfig {
    pub name: String,
    pub channel_type: LogChannelType,
    /// `stdout`/`stderr` for console channels, a directory for file channels.
    pub destination: String,
    pub severity: Severity,
    pub max_file_size: Option<u32>,
    pub exp_time: Option<Duration>,
}

/// Fully parsed gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub ipv4_http_port: u16,
    pub ipv4_https_port: u16,
    pub ipv6_http_port: u16,
    pub ipv6_https_port: u16,

    /// TLS material; present whenever an HTTPS port is enabled.
    pub tls_certificate: Option<PathBuf>,
    pub tls_private_key: Option<PathBuf>,

    pub http_chunk_size: u32,
    pub request_payload_buffer_size: u32,

    pub iomgr_port: u16,
    pub iomgr_family: NetworkFamily,
    pub max_json_payload_size: u32,
    pub iomgr_read_timeout: Duration,

    pub log_channels: Vec<LogChannelConfig>,
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidParameter {
        key: key.to_owned(),
        reason: reason.into(),
    }
}

fn port_param(file: &ConfigFile, key: &str) -> Result<u16, ConfigError> {
    parse_port(file.require(key)?).map_err(|reason| invalid(key, reason))
}

impl GatewayConfig {
    /// Loads `<instance_dir>/config` and parses every parameter the gateway
    /// consumes.
    pub fn load(instance_dir: &std::path::Path) -> Result<Self, ConfigError> {
        let file = ConfigFile::parse(&instance_dir.join("config"))?;
        Self::from_file(&file)
    }

    pub fn from_file(file: &ConfigFile) -> Result<Self, ConfigError> {
        let ipv4_http_port = port_param(file, "rest_server.ipv4_http_port")?;
        let ipv4_https_port = port_param(file, "rest_server.ipv4_https_port")?;
        let ipv6_http_port = port_param(file, "rest_server.ipv6_http_port")?;
        let ipv6_https_port = port_param(file, "rest_server.ipv6_https_port")?;

        // TLS material is only needed when an HTTPS listener is enabled.
        // `tls_certificate_chain` wins over `tls_certificate` when both exist.
        let (tls_certificate, tls_private_key) = if ipv4_https_port != 0 || ipv6_https_port != 0 {
            let cert_value = match file.get("rest_server.tls_certificate_chain") {
                Some(value) => value,
                None => file.require("rest_server.tls_certificate")?,
            };
            let cert = file.resolve_path(cert_value)?;
            let key = file.resolve_path(file.require("rest_server.tls_private_key")?)?;
            (Some(cert), Some(key))
        } else {
            (None, None)
        };

        let key = "rest_server.chunk_size";
        let http_chunk_size =
            parse_byte_size(file.require(key)?).map_err(|reason| invalid(key, reason))?;

        let key = "rest_server.request_payload_buffer_size";
        let request_payload_buffer_size =
            parse_byte_size(file.require(key)?).map_err(|reason| invalid(key, reason))?;

        // IPv4 takes precedence; the IPv6 port is the fallback and switches
        // the dial family.
        let iomgr_ipv4_port = port_param(file, "iomgr.rest.ipv4_port")?;
        let (iomgr_port, iomgr_family) = if iomgr_ipv4_port != 0 {
            (iomgr_ipv4_port, NetworkFamily::Tcp)
        } else {
            let iomgr_ipv6_port = port_param(file, "iomgr.rest.ipv6_port")?;
            if iomgr_ipv6_port == 0 {
                return Err(ConfigError::Validation("missing IOMgr port".into()));
            }
            (iomgr_ipv6_port, NetworkFamily::Tcp6)
        };

        let key = "iomgr.max_json_payload_size";
        let max_json_payload_size =
            parse_byte_size(file.require(key)?).map_err(|reason| invalid(key, reason))?;

        let key = "rest_server.iomgr_read_timeout";
        let iomgr_read_timeout = Duration::from_secs(
            parse_seconds(file.require(key)?).map_err(|reason| invalid(key, reason))?,
        );

        let log_channels = Self::parse_log_channels(file)?;

        Ok(Self {
            ipv4_http_port,
            ipv4_https_port,
            ipv6_http_port,
            ipv6_https_port,
            tls_certificate,
            tls_private_key,
            http_chunk_size,
            request_payload_buffer_size,
            iomgr_port,
            iomgr_family,
            max_json_payload_size,
            iomgr_read_timeout,
            log_channels,
        })
    }

    fn parse_log_channels(file: &ConfigFile) -> Result<Vec<LogChannelConfig>, ConfigError> {
        let names = file.require("log_channels")?;
        let mut channels = Vec::new();

        for name in names.split(',') {
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() {
                continue;
            }

            let key = format!("log.{name}.type");
            let channel_type: LogChannelType = file
                .require(&key)?
                .parse()
                .map_err(|reason: String| invalid(&key, reason))?;

            let destination = file.require(&format!("log.{name}.destination"))?.to_owned();

            let key = format!("log.{name}.severity");
            let severity = match file.get(&key) {
                Some(value) => value.parse().map_err(|reason: String| invalid(&key, reason))?,
                None => Severity::Info,
            };

            let key = format!("log.{name}.max_file_size");
            let max_file_size = match file.get(&key) {
                Some(value) => {
                    Some(parse_byte_size(value).map_err(|reason| invalid(&key, reason))?)
                }
                None => None,
            };

            let key = format!("log.{name}.exp_time");
            let exp_time = match file.get(&key) {
                Some(value) => Some(Duration::from_secs(
                    parse_seconds(value).map_err(|reason| invalid(&key, reason))?,
                )),
                None => None,
            };

            channels.push(LogChannelConfig {
                name,
                channel_type,
                destination,
                severity,
                max_file_size,
                exp_time,
            });
        }

        if channels.is_empty() {
            return Err(ConfigError::Validation(
                "'log_channels' doesn't define any log channel".into(),
            ));
        }
        Ok(channels)
    }

    /// Derives the IOMgr connection pool settings from this configuration.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            host: "localhost".to_owned(),
            port: self.iomgr_port,
            family: self.iomgr_family,
            min_conns: DEFAULT_MIN_CONNS,
            max_conns: DEFAULT_MAX_CONNS,
            read_deadline: self.iomgr_read_timeout,
            max_json_payload_size: u64::from(self.max_json_payload_size),
        }
    }

    pub fn https_enabled(&self) -> bool {
        self.ipv4_https_port != 0 || self.ipv6_https_port != 0
    }
}
