//! Model persistence abstraction
//!
//! The mirroring pipeline reads a model's documents on the exporting side and
//! writes them into the mirrored model on the importing side. Implementations
//! must be thread-safe (Send + Sync) for use in async contexts.

use async_trait::async_trait;
use mirror_core::{FileRecord, ModelCardRevision, ModelId, Release};
use serde::{Deserialize, Serialize};

use crate::error::GatewayResult;

/// Mirror settings of a model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSettings {
    /// Exporting side: the model on the remote instance receiving this model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_model_id: Option<ModelId>,

    /// Importing side: the remote model this model mirrors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_model_id: Option<ModelId>,
}

/// A model as seen by the mirroring pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    /// Model identifier
    pub id: ModelId,

    /// Display name
    pub name: String,

    /// Classification schema selected for the model card
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_schema_id: Option<String>,

    /// Mirror configuration
    #[serde(default)]
    pub mirror: MirrorSettings,
}

impl ModelRecord {
    /// Create a model with no schema and no mirror settings
    pub fn new(id: ModelId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            card_schema_id: None,
            mirror: MirrorSettings::default(),
        }
    }

    /// Select a card schema
    pub fn with_card_schema(mut self, schema_id: impl Into<String>) -> Self {
        self.card_schema_id = Some(schema_id.into());
        self
    }

    /// Configure the export destination
    pub fn mirrored_to(mut self, destination: ModelId) -> Self {
        self.mirror.destination_model_id = Some(destination);
        self
    }

    /// Mark as the mirror of a remote model
    pub fn mirror_of(mut self, source: ModelId) -> Self {
        self.mirror.source_model_id = Some(source);
        self
    }
}

/// Repository trait for model document persistence
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Find a model by id
    ///
    /// # Returns
    /// * `Ok(Some(ModelRecord))` - The model if found
    /// * `Ok(None)` - If no model with that id exists
    async fn find_model(&self, id: &ModelId) -> GatewayResult<Option<ModelRecord>>;

    /// List card revisions of a model, oldest first
    async fn list_card_revisions(&self, model: &ModelId) -> GatewayResult<Vec<ModelCardRevision>>;

    /// List releases of a model, oldest first
    async fn list_releases(&self, model: &ModelId) -> GatewayResult<Vec<Release>>;

    /// List file records of a model
    async fn list_files(&self, model: &ModelId) -> GatewayResult<Vec<FileRecord>>;

    /// Find one file record by id
    async fn find_file(&self, model: &ModelId, file_id: &str) -> GatewayResult<Option<FileRecord>>;

    /// Find the file record whose binary lives at `path`
    async fn find_file_by_path(&self, path: &str) -> GatewayResult<Option<FileRecord>>;

    /// Insert or replace a card revision (keyed by model and version)
    async fn save_card_revision(&self, revision: ModelCardRevision) -> GatewayResult<()>;

    /// Insert or replace a release (keyed by model and semver)
    async fn save_release(&self, release: Release) -> GatewayResult<()>;

    /// Insert or replace a file record (keyed by model and id)
    async fn save_file(&self, file: FileRecord) -> GatewayResult<()>;

    /// Mark the file record at `path` complete
    ///
    /// # Returns
    /// * `Ok(true)` - If a record was found and updated
    /// * `Ok(false)` - If no record exists at that path
    async fn mark_file_complete(&self, path: &str) -> GatewayResult<bool>;
}
