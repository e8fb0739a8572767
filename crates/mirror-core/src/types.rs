//! Core type definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{MirrorError, Result};

/// Identifier of a model on one registry instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    /// Create a validated model id
    ///
    /// Model ids become path and repository segments, so they must be
    /// non-empty and free of separators.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(MirrorError::Validation(
                "Model id cannot be empty".to_string(),
            ));
        }
        if id.contains('/') || id.contains("..") || id.chars().any(char::is_whitespace) {
            return Err(MirrorError::Validation(format!(
                "Model id contains invalid characters: {}",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ModelId {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        ModelId::new(s)
    }
}

/// Correlation identifier for one export or import job (ULID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Ulid);

impl CorrelationId {
    /// Generate a new CorrelationId
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get the underlying ULID
    pub fn as_ulid(&self) -> &Ulid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| MirrorError::Validation(format!("Invalid correlation id: {}", e)))
    }
}

/// The caller on whose behalf a job runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    /// Distinguished name / user id
    pub dn: String,
}

impl User {
    /// Create a user from its distinguished name
    pub fn new(dn: impl Into<String>) -> Self {
        Self { dn: dn.into() }
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dn)
    }
}

/// Model-level actions checked by the authorizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Export a model to its mirror destination
    Export,
    /// Import mirrored documents into a model
    Import,
}

impl Action {
    /// Get the string representation of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Export => "export",
            Action::Import => "import",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which exporter produced an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExporterKind {
    /// Model card revisions, releases and file metadata
    Documents,
    /// One file's binary content
    File,
    /// One container image
    Image,
}

impl ExporterKind {
    /// Get the string representation of the exporter kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ExporterKind::Documents => "documents",
            ExporterKind::File => "file",
            ExporterKind::Image => "image",
        }
    }

    /// The importer that consumes archives of this kind
    pub fn import_kind(&self) -> ImportKind {
        match self {
            ExporterKind::Documents => ImportKind::Documents,
            ExporterKind::File => ImportKind::File,
            ExporterKind::Image => ImportKind::Image,
        }
    }
}

impl fmt::Display for ExporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExporterKind {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "documents" => Ok(Self::Documents),
            "file" => Ok(Self::File),
            "image" => Ok(Self::Image),
            _ => Err(MirrorError::Validation(format!("Invalid exporter kind: {}", s))),
        }
    }
}

/// Which importer an archive must be routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportKind {
    /// Documents archive
    Documents,
    /// Single file archive
    File,
    /// Container image archive
    Image,
}

impl ImportKind {
    /// Get the string representation of the import kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportKind::Documents => "documents",
            ImportKind::File => "file",
            ImportKind::Image => "image",
        }
    }
}

impl fmt::Display for ImportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportKind {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "documents" => Ok(Self::Documents),
            "file" => Ok(Self::File),
            "image" => Ok(Self::Image),
            _ => Err(MirrorError::Validation(format!("Invalid import kind: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id_validation() {
        assert!(ModelId::new("my-model-abc123").is_ok());
        assert!(ModelId::new("").is_err());
        assert!(ModelId::new("a/b").is_err());
        assert!(ModelId::new("..").is_err());
        assert!(ModelId::new("with space").is_err());
    }

    #[test]
    fn test_correlation_id_string_conversion() {
        let id = CorrelationId::new();
        let parsed: CorrelationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [ExporterKind::Documents, ExporterKind::File, ExporterKind::Image] {
            assert_eq!(kind.as_str().parse::<ExporterKind>().unwrap(), kind);
            assert_eq!(kind.import_kind().as_str(), kind.as_str());
        }
        assert!("models".parse::<ImportKind>().is_err());
    }
}
