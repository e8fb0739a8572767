//! Service-layer error helpers
//!
//! The service layer reports every failure as a [`MirrorError`]. This module
//! maps gateway, runtime and configuration errors onto that taxonomy and adds
//! the correlation context every propagated error must carry.

use mirror_core::{ErrorContext, MirrorError};
use mirror_gateway::GatewayError;
use tokio::task::JoinError;

/// Result type alias for service operations
pub type ServiceResult<T> = std::result::Result<T, MirrorError>;

/// Attach an operation message and correlation fields to an error
pub trait ResultExt<T> {
    /// Wrap the error, if any, with `message` and `context`
    fn context(self, message: &str, context: &ErrorContext) -> ServiceResult<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<MirrorError>,
{
    fn context(self, message: &str, context: &ErrorContext) -> ServiceResult<T> {
        self.map_err(|e| e.into().with_context(message, context.clone()))
    }
}

/// Convert a gateway failure
pub fn gateway(err: GatewayError) -> MirrorError {
    MirrorError::from(err)
}

/// A pipeline task panicked or was aborted
pub fn task_failure(err: JoinError, task: &str) -> MirrorError {
    if err.is_cancelled() {
        MirrorError::Io(format!("{} was cancelled", task))
    } else {
        MirrorError::Internal(format!("{} panicked: {}", task, err))
    }
}

/// Configuration could not be loaded or is inconsistent
pub fn configuration(err: config::ConfigError) -> MirrorError {
    MirrorError::Validation(format!("Invalid configuration: {}", err))
}
