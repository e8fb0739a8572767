//! Gateway-specific error types and conversions
//!
//! This module provides error types for collaborator calls: blob store,
//! registry, signing and model persistence.

use mirror_core::MirrorError;
use thiserror::Error;

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Collaborator errors
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Object, model or registry resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Credentials rejected or scope insufficient
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Transport-level failure reaching the collaborator
    #[error("Connection error: {0}")]
    Connection(String),

    /// Unexpected registry response
    #[error("Protocol error (status {status}): {message}")]
    Protocol {
        /// HTTP status code, 0 if none was received
        status: u16,
        /// Response summary
        message: String,
    },

    /// Streaming I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid data format
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Signing service failure
    #[error("Signing error: {0}")]
    Signing(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal gateway error
    #[error("Internal gateway error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Check if this error is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }

    /// Check if this is a transient error that could be retried
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Connection(_) | GatewayError::Io(_) => true,
            GatewayError::Protocol { status, .. } => *status == 0 || *status >= 500,
            _ => false,
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(format!("{}", err))
    }
}

impl From<url::ParseError> for GatewayError {
    fn from(err: url::ParseError) -> Self {
        GatewayError::Configuration(format!("Invalid URL: {}", err))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            GatewayError::Connection(err.to_string())
        } else if let Some(status) = err.status() {
            GatewayError::Protocol {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            GatewayError::Io(err.to_string())
        }
    }
}

impl From<jsonwebtoken::errors::Error> for GatewayError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        GatewayError::Internal(format!("Token encoding failed: {}", err))
    }
}

/// Map collaborator failures onto the mirroring taxonomy
impl From<GatewayError> for MirrorError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound(msg) => MirrorError::NotFound(msg),
            GatewayError::PermissionDenied(msg) => MirrorError::Authorization(msg),
            GatewayError::Protocol { status, message } => MirrorError::Protocol { status, message },
            GatewayError::Connection(msg) | GatewayError::Io(msg) => MirrorError::Io(msg),
            GatewayError::InvalidData(msg) | GatewayError::Configuration(msg) => {
                MirrorError::Validation(msg)
            }
            GatewayError::Serialization(msg) => MirrorError::Serialization(msg),
            other => MirrorError::Internal(other.to_string()),
        }
    }
}
