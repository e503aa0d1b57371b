//! Configuration validation logic.

use crate::config::schema::{
    GatewayConfig, LogChannelType, HTTP_CHUNK_SIZE_MAX, HTTP_CHUNK_SIZE_MIN, JSON_PAYLOAD_MAX,
    JSON_PAYLOAD_MIN, LOG_FILE_EXP_TIME_MIN_SECS, LOG_FILE_SIZE_MIN, READ_DEADLINE_MAX_SECS,
    READ_DEADLINE_MIN_SECS, REQUEST_PAYLOAD_BUFFER_MAX, REQUEST_PAYLOAD_BUFFER_MIN,
};

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validates a parsed [`GatewayConfig`] for semantic correctness.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // 1. At least one listener must be enabled.
    if config.ipv4_http_port == 0
        && config.ipv4_https_port == 0
        && config.ipv6_http_port == 0
        && config.ipv6_https_port == 0
    {
        errors.push(ValidationError(
            "all rest_server listener ports are disabled".to_string(),
        ));
    }

    // 2. HTTPS listeners need TLS material.
    if config.https_enabled()
        && (config.tls_certificate.is_none() || config.tls_private_key.is_none())
    {
        errors.push(ValidationError(
            "HTTPS is enabled but TLS certificate or private key is missing".to_string(),
        ));
    }

    // 3. Size and deadline ranges.
    if config.http_chunk_size < HTTP_CHUNK_SIZE_MIN || config.http_chunk_size > HTTP_CHUNK_SIZE_MAX
    {
        errors.push(ValidationError(format!(
            "'rest_server.chunk_size' ({}) is out of range ({HTTP_CHUNK_SIZE_MIN}-{HTTP_CHUNK_SIZE_MAX})",
            config.http_chunk_size
        )));
    }
    if config.request_payload_buffer_size < REQUEST_PAYLOAD_BUFFER_MIN
        || config.request_payload_buffer_size > REQUEST_PAYLOAD_BUFFER_MAX
    {
        errors.push(ValidationError(format!(
            "'rest_server.request_payload_buffer_size' ({}) is out of range ({REQUEST_PAYLOAD_BUFFER_MIN}-{REQUEST_PAYLOAD_BUFFER_MAX})",
            config.request_payload_buffer_size
        )));
    }
    if config.max_json_payload_size < JSON_PAYLOAD_MIN
        || config.max_json_payload_size > JSON_PAYLOAD_MAX
    {
        errors.push(ValidationError(format!(
            "'iomgr.max_json_payload_size' ({}) is out of range ({JSON_PAYLOAD_MIN}-{JSON_PAYLOAD_MAX})",
            config.max_json_payload_size
        )));
    }
    let read_timeout = config.iomgr_read_timeout.as_secs();
    if read_timeout < READ_DEADLINE_MIN_SECS || read_timeout > READ_DEADLINE_MAX_SECS {
        errors.push(ValidationError(format!(
            "'rest_server.iomgr_read_timeout' ({read_timeout}) is out of range ({READ_DEADLINE_MIN_SECS}-{READ_DEADLINE_MAX_SECS})"
        )));
    }

    // 4. Log channel constraints.
    for channel in &config.log_channels {
        if channel.channel_type == LogChannelType::Console
            && channel.destination != "stdout"
            && channel.destination != "stderr"
        {
            errors.push(ValidationError(format!(
                "console log channel '{}' destination must be stdout or stderr",
                channel.name
            )));
        }
        if let Some(size) = channel.max_file_size {
            if size < LOG_FILE_SIZE_MIN {
                errors.push(ValidationError(format!(
                    "log channel '{}' max_file_size ({size}) is below the minimum ({LOG_FILE_SIZE_MIN})",
                    channel.name
                )));
            }
        }
        if let Some(exp) = channel.exp_time {
            if exp.as_secs() < LOG_FILE_EXP_TIME_MIN_SECS {
                errors.push(ValidationError(format!(
                    "log channel '{}' exp_time ({}) is below the minimum ({LOG_FILE_EXP_TIME_MIN_SECS})",
                    channel.name,
                    exp.as_secs()
                )));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
