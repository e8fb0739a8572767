//! Importers
//!
//! An importer consumes one archive produced by an exporter of the matching
//! kind. [`run_import`] drives it: entries are decoded one at a time and the
//! next entry is only read once the importer has finished with the current
//! one, so the order of effects on the destination follows the archive order.
//!
//! Any failure is fatal to the job. Entries handled before the failure stay
//! persisted.

pub mod documents;
pub mod file;
pub mod image;
pub mod router;

pub use documents::{DocumentImporter, DocumentsSummary};
pub use file::{FileImportResult, FileImporter};
pub use image::{ImageImportResult, ImageImporter};
pub use router::{EntryRouter, RouteMatch};

use async_trait::async_trait;
use mirror_core::{Action, ImportJob, ImportKind, ImportMetadata, MirrorError};
use mirror_gateway::{ByteReader, ModelRecord};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, instrument, warn};

use crate::archive::{ArchiveEntry, ArchiveReader, EntryHeader, EntryKind};
use crate::context::MirrorContext;
use crate::error::ServiceResult;

/// Kind-specific handling of archive entries
#[async_trait]
pub trait Importer: Send + Sized {
    /// What a successful import resolves with
    type Output: Send;

    /// Importer kind
    fn kind(&self) -> ImportKind;

    /// Handle one file entry; `content` holds exactly `header.size` bytes
    async fn process_entry(&mut self, header: &EntryHeader, content: ByteReader)
        -> ServiceResult<()>;

    /// Called once the archive ends
    async fn finish(self) -> ServiceResult<Self::Output>;
}

/// Result of one import job
#[derive(Debug, Clone, PartialEq)]
pub enum ImportOutcome {
    /// Documents archive
    Documents(DocumentsSummary),
    /// File archive
    File(FileImportResult),
    /// Image archive
    Image(ImageImportResult),
}

impl ImportOutcome {
    /// Metadata of the imported archive
    pub fn metadata(&self) -> &ImportMetadata {
        match self {
            ImportOutcome::Documents(summary) => &summary.metadata,
            ImportOutcome::File(result) => &result.metadata,
            ImportOutcome::Image(result) => &result.metadata,
        }
    }
}

/// Check the job before any entry is read
///
/// The metadata must be consistent, the mirrored model must exist and be
/// configured as a mirror of the archive's source model, and the initiator
/// must be allowed to import into it.
pub async fn guard_import(context: &MirrorContext, job: &ImportJob) -> ServiceResult<ModelRecord> {
    let metadata = &job.metadata;
    metadata.validate()?;

    let model = context
        .model_store
        .find_model(&metadata.mirrored_model_id)
        .await?
        .ok_or_else(|| {
            MirrorError::NotFound(format!(
                "Mirrored model {} not found",
                metadata.mirrored_model_id
            ))
        })?;

    if model.mirror.source_model_id.as_ref() != Some(&metadata.source_model_id) {
        return Err(MirrorError::Validation(format!(
            "Model {} is not a mirror of {}",
            model.id, metadata.source_model_id
        )));
    }

    let decision = context
        .authorizer
        .check_model_action(&job.initiator, &model.id, Action::Import)
        .await?;
    if !decision.success {
        return Err(MirrorError::Authorization(decision.info.unwrap_or_else(|| {
            format!("{} may not import into model {}", job.initiator, model.id)
        })));
    }

    Ok(model)
}

/// Read an entry fully into memory, refusing entries larger than `limit`
pub(crate) async fn read_small(
    header: &EntryHeader,
    mut content: ByteReader,
    limit: u64,
) -> ServiceResult<Vec<u8>> {
    if header.size > limit {
        return Err(MirrorError::Validation(format!(
            "Entry {} is {} bytes, more than the {} allowed",
            header.name, header.size, limit
        )));
    }
    let mut body = Vec::with_capacity(header.size as usize);
    content.read_to_end(&mut body).await?;
    Ok(body)
}

/// Feed every entry of `stream` to `importer` and resolve its output
///
/// Non-file entries are skipped. Errors are wrapped with the entry name and
/// size plus the job's correlation fields.
#[instrument(skip(importer, stream), fields(job = %metadata.correlation_id, kind = %metadata.import_kind))]
pub async fn run_import<I: Importer>(
    mut importer: I,
    metadata: &ImportMetadata,
    stream: ByteReader,
) -> ServiceResult<I::Output> {
    let job_context = metadata.error_context();
    let mut reader = ArchiveReader::new(stream);
    let mut handled = 0usize;

    loop {
        let ArchiveEntry { header, content } = match reader.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, handled, "Archive could not be read");
                return Err(e.with_context("reading archive", job_context));
            }
        };

        if header.kind != EntryKind::File {
            warn!(entry = %header.name, kind = ?header.kind, "Skipping non-file archive entry");
            continue;
        }

        debug!(entry = %header.name, size = header.size, "handling entry");
        if let Err(e) = importer.process_entry(&header, content).await {
            let context = job_context
                .clone()
                .with("entry", &header.name)
                .with("entrySize", header.size);
            error!(error = %e, context = %context, "Import rejected");
            return Err(e.with_context(format!("processing entry {}", header.name), context));
        }
        handled += 1;
    }

    if let Err(e) = reader.close().await {
        return Err(e.with_context("reading archive", job_context));
    }

    match importer.finish().await {
        Ok(output) => {
            info!(entries = handled, "Import resolved");
            Ok(output)
        }
        Err(e) => {
            error!(error = %e, entries = handled, "Import rejected while finishing");
            Err(e.with_context("finishing import", job_context))
        }
    }
}
