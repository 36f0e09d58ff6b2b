//! Unified error handling for Dev Proxy
//!
//! This module provides a centralized error type system that eliminates
//! the need for modules to depend on each other for error handling.

use std::fmt;

/// Unified error types for the proxy system
#[derive(Debug)]
pub enum ProxyError {
    /// Configuration-related errors
    Configuration(String),

    /// Network and I/O errors
    Network(std::io::Error),

    /// TLS termination errors
    Tls(String),

    /// Certificate authority failures (minting, persistence, trust install)
    Certificate(String),

    /// Upstream fetch failures
    Upstream(String),

    /// Plugin construction or execution errors
    Plugin(String),

    /// Serialization/deserialization errors
    Serialization(String),

    /// Internal system errors
    Internal(String),

    /// Validation errors
    Validation(String),
}

impl ProxyError {
    pub fn serialization_error(context: &str, err: impl fmt::Display) -> Self {
        ProxyError::Serialization(format!("{context}: {err}"))
    }

    pub fn upstream_error(err: impl fmt::Display) -> Self {
        ProxyError::Upstream(err.to_string())
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            ProxyError::Network(err) => write!(f, "Network error: {err}"),
            ProxyError::Tls(msg) => write!(f, "TLS error: {msg}"),
            ProxyError::Certificate(msg) => write!(f, "Certificate error: {msg}"),
            ProxyError::Upstream(msg) => write!(f, "Upstream fetch failed: {msg}"),
            ProxyError::Plugin(msg) => write!(f, "Plugin execution error: {msg}"),
            ProxyError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            ProxyError::Internal(msg) => write!(f, "Internal error: {msg}"),
            ProxyError::Validation(msg) => write!(f, "Validation error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Network(err) => Some(err),
            _ => None,
        }
    }
}

// Error conversions
impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Network(err)
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Serialization(err.to_string())
    }
}

impl From<validator::ValidationErrors> for ProxyError {
    fn from(err: validator::ValidationErrors) -> Self {
        ProxyError::Validation(err.to_string())
    }
}

impl From<notify::Error> for ProxyError {
    fn from(err: notify::Error) -> Self {
        ProxyError::Internal(format!("File watcher error: {err}"))
    }
}

impl From<rcgen::Error> for ProxyError {
    fn from(err: rcgen::Error) -> Self {
        ProxyError::Certificate(err.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Upstream(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Network(std::io::Error::other(err))
    }
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> ProxyResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> ProxyResult<T> {
        self.map_err(|e| ProxyError::Internal(format!("{context}: {e}")))
    }
}

/// Convenience macros for error creation
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::core::ProxyError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::ProxyError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::core::ProxyError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::ProxyError::Internal(format!($fmt, $($arg)*))
    };
}
