//! Collaborators shared by exporters and importers

use mirror_gateway::{Authorizer, BlobStore, ModelStore, RegistryGateway, TokenIssuer};
use std::sync::Arc;

use crate::upload::UploadOrchestrator;

/// Settings the pipeline needs beyond its collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Whether this instance may export
    pub export_enabled: bool,
    /// Bucket holding model file binaries
    pub files_bucket: String,
    /// Largest image manifest an importer will buffer
    pub max_manifest_bytes: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            export_enabled: true,
            files_bucket: "model-files".to_string(),
            max_manifest_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Everything an export or import job talks to
#[derive(Clone)]
pub struct MirrorContext {
    /// Model documents
    pub model_store: Arc<dyn ModelStore>,
    /// Archives and file binaries
    pub blob_store: Arc<dyn BlobStore>,
    /// Container image registry
    pub registry: Arc<dyn RegistryGateway>,
    /// Registry token minting
    pub token_issuer: Arc<dyn TokenIssuer>,
    /// Capability checks
    pub authorizer: Arc<dyn Authorizer>,
    /// Archive upload
    pub uploader: Arc<UploadOrchestrator>,
    /// Pipeline settings
    pub settings: PipelineSettings,
}

impl std::fmt::Debug for MirrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorContext")
            .field("settings", &self.settings)
            .field("signing", &self.uploader.signing_enabled())
            .finish()
    }
}
