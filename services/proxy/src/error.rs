//! Error types for the proxy.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Configuration errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read the config document.
    #[error("config_read_failed: {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Could not parse the config document.
    #[error("config_parse_failed: {0}")]
    ParseFailed(String),

    /// A service field is missing or out of range.
    #[error("invalid_field: service {service}: {field}: {detail}")]
    InvalidField {
        service: String,
        field: &'static str,
        detail: String,
    },

    /// Two services claim the same proxy port.
    #[error("duplicate_proxy_port: port {port} used by {first} and {second}")]
    DuplicateProxyPort {
        port: u16,
        first: String,
        second: String,
    },

    /// The document yields no usable service.
    #[error("no_services: configuration contains no valid services")]
    NoServices,
}

impl ConfigError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConfigError::ReadFailed { .. } => "config_read_failed",
            ConfigError::ParseFailed(_) => "config_parse_failed",
            ConfigError::InvalidField { .. } => "invalid_field",
            ConfigError::DuplicateProxyPort { .. } => "duplicate_proxy_port",
            ConfigError::NoServices => "no_services",
        }
    }

    pub(crate) fn invalid(service: &str, field: &'static str, detail: impl Into<String>) -> Self {
        ConfigError::InvalidField {
            service: service.to_string(),
            field,
            detail: detail.into(),
        }
    }
}

/// Errors starting or running proxied services.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Service configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Could not bind the proxy listener.
    #[error("bind_failed: {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::Config(e) => e.reason_code(),
            ProxyError::BindFailed { .. } => "bind_failed",
        }
    }
}
