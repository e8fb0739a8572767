//! Single file export

use async_trait::async_trait;
use mirror_core::{
    ExportJob, ExporterKind, FileRecord, ImportMetadata, MirrorError, StorageLocation,
};
use tracing::debug;

use super::{ExportScope, ExportSource};
use crate::archive::ArchiveSink;
use crate::error::ServiceResult;

/// Exports the binary of one file under its original storage path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileExport {
    file_id: String,
}

impl FileExport {
    /// Export the file with id `file_id`
    pub fn new(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
        }
    }

    /// Id of the exported file
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    async fn resolve(&self, scope: &ExportScope<'_>) -> ServiceResult<FileRecord> {
        let model = &scope.job.source_model_id;
        let file = scope
            .context
            .model_store
            .find_file(model, &self.file_id)
            .await?
            .ok_or_else(|| {
                MirrorError::NotFound(format!("File {} not found on model {}", self.file_id, model))
            })?;

        if !file.complete {
            return Err(MirrorError::Validation(format!(
                "File {} has not finished uploading",
                file.id
            )));
        }
        Ok(file)
    }
}

#[async_trait]
impl ExportSource for FileExport {
    fn kind(&self) -> ExporterKind {
        ExporterKind::File
    }

    async fn prepare(&self, scope: &ExportScope<'_>) -> ServiceResult<ImportMetadata> {
        let file = self.resolve(scope).await?;
        Ok(ImportMetadata::file(
            scope.destination.clone(),
            scope.job.source_model_id.clone(),
            scope.job.correlation_id,
            file.path,
        ))
    }

    fn archive_name(&self, job: &ExportJob) -> String {
        format!(
            "{}-file-{}-{}.tar.gz",
            job.source_model_id, self.file_id, job.correlation_id
        )
    }

    async fn add_data(
        &self,
        scope: &ExportScope<'_>,
        sink: &mut ArchiveSink,
    ) -> ServiceResult<usize> {
        let file = self.resolve(scope).await?;
        let location =
            StorageLocation::new(scope.context.settings.files_bucket.clone(), file.path.clone())?;

        let blobs = &scope.context.blob_store;
        let info = blobs.metadata(&location).await?;
        let body = blobs.get_stream(&location).await?;
        debug!(%location, size = info.size, "streaming file binary");

        sink.add_entry(file.path, info.size, body).await?;
        Ok(1)
    }
}
