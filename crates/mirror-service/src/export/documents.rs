//! Documents export: card revisions, releases and file records of a model

use async_trait::async_trait;
use mirror_core::{
    ArchivedDocument, ExportJob, ExporterKind, ImportMetadata, MirrorProvenance, MirroredDocument,
};
use tracing::debug;

use super::{ExportScope, ExportSource};
use crate::archive::ArchiveSink;
use crate::error::ServiceResult;

/// Exports every document of a model
///
/// Card revisions come first, then releases, then file records, so an
/// importer never sees a release before the card it describes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentsExport;

async fn write_documents<T: MirroredDocument>(
    sink: &mut ArchiveSink,
    documents: Vec<T>,
    provenance: &MirrorProvenance,
) -> ServiceResult<usize> {
    let count = documents.len();
    for document in documents {
        let name = document.entry_name();
        let body = ArchivedDocument::new(document, provenance.clone()).to_bytes()?;
        sink.add_bytes(name, body).await?;
    }
    debug!(label = T::LABEL, count, "documents written");
    Ok(count)
}

#[async_trait]
impl ExportSource for DocumentsExport {
    fn kind(&self) -> ExporterKind {
        ExporterKind::Documents
    }

    async fn prepare(&self, scope: &ExportScope<'_>) -> ServiceResult<ImportMetadata> {
        Ok(ImportMetadata::documents(
            scope.destination.clone(),
            scope.job.source_model_id.clone(),
            scope.job.correlation_id,
        ))
    }

    fn archive_name(&self, job: &ExportJob) -> String {
        format!("{}-documents-{}.tar.gz", job.source_model_id, job.correlation_id)
    }

    async fn add_data(
        &self,
        scope: &ExportScope<'_>,
        sink: &mut ArchiveSink,
    ) -> ServiceResult<usize> {
        let model = &scope.job.source_model_id;
        let store = &scope.context.model_store;
        let provenance = scope.provenance()?;

        let cards = store.list_card_revisions(model).await?;
        let releases = store.list_releases(model).await?;
        let files = store.list_files(model).await?;

        let mut written = write_documents(sink, cards, &provenance).await?;
        written += write_documents(sink, releases, &provenance).await?;
        written += write_documents(sink, files, &provenance).await?;
        Ok(written)
    }
}
