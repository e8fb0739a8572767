//! Container image export
//!
//! Pulls one image from the registry repository of the source model and
//! writes its blobs followed by its manifest:
//!
//! ```text
//! <name>:<tag>/blobs/sha256/<hex>
//! <name>:<tag>/manifest.json
//! ```
//!
//! The manifest comes last so an importer has pushed every blob before it
//! commits the manifest.

use async_trait::async_trait;
use mirror_core::{ExportJob, ExporterKind, ImageIdentity, ImportMetadata, MirrorError};
use mirror_gateway::RegistryAction;
use std::collections::HashSet;
use tracing::{debug, instrument};

use super::{ExportScope, ExportSource};
use crate::archive::ArchiveSink;
use crate::error::ServiceResult;

/// Exports one container image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageExport {
    image: ImageIdentity,
}

impl ImageExport {
    /// Export `image` from the source model's registry repository
    pub fn new(image: ImageIdentity) -> Self {
        Self { image }
    }

    /// The exported image
    pub fn image(&self) -> &ImageIdentity {
        &self.image
    }
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl ExportSource for ImageExport {
    fn kind(&self) -> ExporterKind {
        ExporterKind::Image
    }

    async fn prepare(&self, scope: &ExportScope<'_>) -> ServiceResult<ImportMetadata> {
        Ok(ImportMetadata::image(
            scope.destination.clone(),
            scope.job.source_model_id.clone(),
            scope.job.correlation_id,
            &self.image,
        ))
    }

    fn archive_name(&self, job: &ExportJob) -> String {
        format!(
            "{}-image-{}-{}-{}.tar.gz",
            job.source_model_id,
            sanitize(&self.image.name),
            sanitize(&self.image.tag),
            job.correlation_id
        )
    }

    #[instrument(skip(self, scope, sink), fields(image = %self.image))]
    async fn add_data(
        &self,
        scope: &ExportScope<'_>,
        sink: &mut ArchiveSink,
    ) -> ServiceResult<usize> {
        let repository = self.image.repository(&scope.job.source_model_id);
        let context = scope.context;
        let token = context
            .token_issuer
            .issue(&scope.job.initiator, &repository, RegistryAction::PULL)
            .await?;

        let manifest = context
            .registry
            .get_manifest(&token, &repository, &self.image.tag)
            .await?;
        if manifest.is_index() {
            return Err(MirrorError::Validation(format!(
                "Image {} is a multi-platform index ({}); only single manifests can be mirrored",
                self.image,
                manifest.media_type()
            )));
        }

        let mut seen = HashSet::new();
        for reference in manifest.references() {
            if !seen.insert(reference.digest.clone()) {
                continue;
            }
            let blob = context
                .registry
                .get_blob(&token, &repository, &reference.digest)
                .await?;
            if blob.size != reference.size {
                return Err(MirrorError::Validation(format!(
                    "Blob {} is {} bytes but the manifest declares {}",
                    reference.digest, blob.size, reference.size
                )));
            }
            debug!(digest = %reference.digest, size = blob.size, "exporting blob");
            sink.add_entry(self.image.blob_entry(&reference.digest), blob.size, blob.body)
                .await?;
        }

        sink.add_bytes(self.image.manifest_entry(), manifest.body().to_vec())
            .await?;
        Ok(seen.len() + 1)
    }
}
