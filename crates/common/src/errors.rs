//! Error types for Tether
//!
//! This module defines the error types shared by the configuration loader and
//! the upstream layer. Failures that belong to connection reuse itself (a full
//! idle cache, a peer closing an idle socket) are not errors and never show up
//! here; only configuration and upstream selection failures do.

use thiserror::Error;

/// Main error type for Tether operations
#[derive(Error, Debug)]
pub enum TetherError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Upstream connection errors
    #[error("Upstream error: {upstream} - {message}")]
    Upstream {
        upstream: String,
        message: String,
        retryable: bool,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors
    #[error("Timeout: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// No healthy upstream available
    #[error("No healthy upstream available")]
    NoHealthyUpstream,
}

/// Result type alias for Tether operations
pub type TetherResult<T> = Result<T, TetherError>;

impl TetherError {
    /// Determine if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            Self::Io { .. } => true,
            _ => false,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create an upstream error
    pub fn upstream(upstream: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            upstream: upstream.into(),
            message: message.into(),
            retryable: false,
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }
}

/// Helper for converting IO errors
impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

/// Configuration loading reports through `anyhow`; keep the full chain.
impl From<anyhow::Error> for TetherError {
    fn from(err: anyhow::Error) -> Self {
        Self::Config {
            message: format!("{:#}", err),
            source: Some(err.into()),
        }
    }
}
