//! Provenance tagging for mirrored documents
//!
//! Every document written into an archive carries a [`MirrorProvenance`]
//! block naming the exporter, both ends of the mirror and the job that
//! produced it. Importers compare it against the job they are running.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MirrorError, Result};
use crate::types::{CorrelationId, ExporterKind, ImportKind, ModelId};

/// Provenance information attached to an archived document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorProvenance {
    /// Exporter that wrote the document
    pub exporter_kind: ExporterKind,

    /// Importer the document is intended for
    pub import_kind: ImportKind,

    /// Model the document was exported from
    pub source_model_id: ModelId,

    /// Model the document is destined for
    pub destination_model_id: ModelId,

    /// Export job that wrote the document
    pub correlation_id: CorrelationId,

    /// Timestamp when the document was exported
    pub exported_at: DateTime<Utc>,
}

impl MirrorProvenance {
    /// Create a provenance record with a builder pattern
    pub fn builder(
        exporter_kind: ExporterKind,
        source_model_id: ModelId,
        destination_model_id: ModelId,
    ) -> MirrorProvenanceBuilder {
        MirrorProvenanceBuilder::new(exporter_kind, source_model_id, destination_model_id)
    }

    /// Validate the provenance information
    pub fn validate(&self) -> Result<()> {
        if self.exporter_kind.import_kind() != self.import_kind {
            return Err(MirrorError::Validation(format!(
                "Provenance import kind {} does not match exporter kind {}",
                self.import_kind, self.exporter_kind
            )));
        }
        if self.source_model_id == self.destination_model_id {
            return Err(MirrorError::Validation(format!(
                "Source and destination model must differ: {}",
                self.source_model_id
            )));
        }
        Ok(())
    }

    /// Check that this document came from the expected source model
    pub fn verify_source(&self, expected: &ModelId) -> Result<()> {
        if &self.source_model_id != expected {
            return Err(MirrorError::Validation(format!(
                "Document was exported from model {} but job expects {}",
                self.source_model_id, expected
            )));
        }
        Ok(())
    }
}

impl fmt::Display for MirrorProvenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Provenance({} {} -> {}, job={})",
            self.exporter_kind, self.source_model_id, self.destination_model_id, self.correlation_id
        )
    }
}

/// Builder for creating MirrorProvenance instances
pub struct MirrorProvenanceBuilder {
    provenance: MirrorProvenance,
}

impl MirrorProvenanceBuilder {
    /// Create a new builder
    pub fn new(
        exporter_kind: ExporterKind,
        source_model_id: ModelId,
        destination_model_id: ModelId,
    ) -> Self {
        Self {
            provenance: MirrorProvenance {
                exporter_kind,
                import_kind: exporter_kind.import_kind(),
                source_model_id,
                destination_model_id,
                correlation_id: CorrelationId::new(),
                exported_at: Utc::now(),
            },
        }
    }

    /// Set the correlation id of the export job
    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.provenance.correlation_id = id;
        self
    }

    /// Set the export timestamp
    pub fn exported_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.provenance.exported_at = timestamp;
        self
    }

    /// Build the MirrorProvenance instance with validation
    pub fn build(self) -> Result<MirrorProvenance> {
        self.provenance.validate()?;
        Ok(self.provenance)
    }
}
