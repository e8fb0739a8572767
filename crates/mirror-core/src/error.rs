//! Error types for the model mirroring pipeline
//!
//! Every failure is classified into one [`ErrorKind`]. Errors crossing a job
//! boundary are wrapped in [`MirrorError::Contextual`] so they carry the
//! correlation identifiers of the job that produced them.

use std::fmt;
use thiserror::Error;

/// Result type alias for mirroring operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Result type alias used by the service layer
pub type MirrorResult<T> = std::result::Result<T, MirrorError>;

/// Taxonomy of mirroring failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Input or precondition failed validation
    Validation,
    /// Caller is not allowed to perform the action
    Authorization,
    /// A referenced model, document or object does not exist
    NotFound,
    /// Unexpected internal failure
    Internal,
    /// The registry answered with an unexpected response
    Protocol,
    /// An operation was called out of order (programming error)
    IllegalState,
    /// Payload could not be encoded or decoded
    Serialization,
    /// Stream or transport I/O failed
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authorization => "authorization",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
            ErrorKind::Protocol => "protocol",
            ErrorKind::IllegalState => "illegal_state",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

/// Ordered correlation fields attached to an error
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    fields: Vec<(String, String)>,
}

impl ErrorContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, replacing an existing field of the same name
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a field in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(field) => field.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Merge another context into this one; fields already present win
    pub fn merge(mut self, other: &ErrorContext) -> Self {
        for (key, value) in &other.fields {
            if self.get(key).is_none() {
                self.fields.push((key.clone(), value.clone()));
            }
        }
        self
    }

    /// Look up a field
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether no fields are set
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over the fields in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Main error type for mirroring operations
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Authorization error
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unexpected response from the registry
    #[error("Registry protocol error (status {status}): {message}")]
    Protocol {
        /// HTTP status returned, 0 when the response could not be read
        status: u16,
        /// Description of what was expected
        message: String,
    },

    /// Operation invoked out of order
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stream or transport I/O error
    #[error("IO error: {0}")]
    Io(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Error enriched with operation and correlation context
    #[error("{message}: {source} [{context}]")]
    Contextual {
        /// What was being attempted
        message: String,
        /// Correlation fields
        context: ErrorContext,
        /// Underlying error
        #[source]
        source: Box<MirrorError>,
    },
}

impl MirrorError {
    /// Wrap this error with an operation message and correlation context
    pub fn with_context(self, message: impl Into<String>, context: ErrorContext) -> Self {
        MirrorError::Contextual {
            message: message.into(),
            context,
            source: Box::new(self),
        }
    }

    /// Classify the error, looking through any context wrappers
    pub fn kind(&self) -> ErrorKind {
        match self {
            MirrorError::Validation(_) => ErrorKind::Validation,
            MirrorError::Authorization(_) => ErrorKind::Authorization,
            MirrorError::NotFound(_) => ErrorKind::NotFound,
            MirrorError::Protocol { .. } => ErrorKind::Protocol,
            MirrorError::IllegalState(_) => ErrorKind::IllegalState,
            MirrorError::Serialization(_) => ErrorKind::Serialization,
            MirrorError::Io(_) => ErrorKind::Io,
            MirrorError::Internal(_) => ErrorKind::Internal,
            MirrorError::Contextual { source, .. } => source.kind(),
        }
    }

    /// The innermost error with all context layers removed
    pub fn root(&self) -> &MirrorError {
        match self {
            MirrorError::Contextual { source, .. } => source.root(),
            other => other,
        }
    }

    /// Collect the context of every wrapper, outermost first
    pub fn context(&self) -> ErrorContext {
        match self {
            MirrorError::Contextual {
                context, source, ..
            } => context.clone().merge(&source.context()),
            _ => ErrorContext::new(),
        }
    }

    /// Whether the caller could reasonably retry the same call
    ///
    /// Out-of-order calls are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            MirrorError::Io(_) => true,
            MirrorError::Protocol { status, .. } => *status == 0 || *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::Serialization(err.to_string())
    }
}

impl From<semver::Error> for MirrorError {
    fn from(err: semver::Error) -> Self {
        MirrorError::Validation(format!("Invalid version: {}", err))
    }
}

impl From<std::io::Error> for MirrorError {
    fn from(err: std::io::Error) -> Self {
        MirrorError::Io(err.to_string())
    }
}
