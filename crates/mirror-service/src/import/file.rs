//! File importer
//!
//! A file archive holds exactly one entry, named after the file's storage
//! path on the source instance. The binary lands on the mirrored path of the
//! destination model. Replaying an archive whose file is already complete
//! only drains the entry.

use async_trait::async_trait;
use mirror_core::{FileRecord, ImportKind, ImportMetadata, MirrorError, ObjectMetadata, StorageLocation};
use mirror_gateway::ByteReader;
use tracing::{info, instrument, warn};

use super::router::EntryRouter;
use super::Importer;
use crate::archive::EntryHeader;
use crate::context::MirrorContext;
use crate::error::ServiceResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileRoute {
    Binary,
}

/// Result of a file import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileImportResult {
    /// Metadata of the imported archive
    pub metadata: ImportMetadata,
    /// Storage path on the source instance
    pub source_path: String,
    /// Storage path on this instance
    pub new_path: String,
    /// Bytes read from the archive
    pub size: u64,
    /// Whether the file was already complete and the entry was discarded
    pub skipped: bool,
}

/// Stores the single binary of a file archive
pub struct FileImporter {
    context: MirrorContext,
    router: EntryRouter<FileRoute>,
    metadata: ImportMetadata,
    source_path: String,
    new_path: String,
    handled: Option<(u64, bool)>,
}

impl std::fmt::Debug for FileImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileImporter")
            .field("source_path", &self.source_path)
            .field("new_path", &self.new_path)
            .field("handled", &self.handled)
            .finish()
    }
}

impl FileImporter {
    /// Create an importer for one file archive
    pub fn new(context: MirrorContext, metadata: ImportMetadata) -> ServiceResult<Self> {
        let source_path = match (&metadata.import_kind, &metadata.file_path) {
            (ImportKind::File, Some(path)) if !path.is_empty() => path.clone(),
            _ => {
                return Err(MirrorError::Validation(format!(
                    "File importer needs file import metadata, got {} without a path",
                    metadata.import_kind
                )))
            }
        };
        let new_path = FileRecord::mirrored_path(&source_path, &metadata.mirrored_model_id);
        let router = EntryRouter::new()
            .route(&format!("^{}$", regex::escape(&source_path)), FileRoute::Binary)?;

        Ok(Self {
            context,
            router,
            metadata,
            source_path,
            new_path,
            handled: None,
        })
    }

    /// Path the binary is written to
    pub fn new_path(&self) -> &str {
        &self.new_path
    }

    async fn already_complete(&self) -> ServiceResult<bool> {
        let existing = self
            .context
            .model_store
            .find_file_by_path(&self.new_path)
            .await?;
        Ok(existing.is_some_and(|f| f.complete))
    }
}

#[async_trait]
impl Importer for FileImporter {
    type Output = FileImportResult;

    fn kind(&self) -> ImportKind {
        ImportKind::File
    }

    #[instrument(skip(self, header, content), fields(entry = %header.name, path = %self.new_path))]
    async fn process_entry(
        &mut self,
        header: &EntryHeader,
        mut content: ByteReader,
    ) -> ServiceResult<()> {
        if self.handled.is_some() {
            return Err(MirrorError::Validation(format!(
                "Multiple files found in archive: {} follows {}",
                header.name, self.source_path
            )));
        }
        if self.router.resolve(&header.name).is_none() {
            return Err(MirrorError::Validation(format!(
                "Unexpected file {} in archive for {}",
                header.name, self.source_path
            )));
        }

        if self.already_complete().await? {
            let drained = tokio::io::copy(&mut content, &mut tokio::io::sink()).await?;
            info!(bytes = drained, "File already mirrored, entry discarded");
            self.handled = Some((drained, true));
            return Ok(());
        }

        let location =
            StorageLocation::new(self.context.settings.files_bucket.clone(), self.new_path.clone())?;
        let written = self
            .context
            .blob_store
            .put_stream(&location, content, ObjectMetadata::new())
            .await?;

        if !self
            .context
            .model_store
            .mark_file_complete(&self.new_path)
            .await?
        {
            warn!(path = %self.new_path, "No file record to mark complete; binary stored without one");
        }
        info!(bytes = written, %location, "File stored");
        self.handled = Some((written, false));
        Ok(())
    }

    async fn finish(self) -> ServiceResult<FileImportResult> {
        let (size, skipped) = self.handled.ok_or_else(|| {
            MirrorError::Validation(format!("Archive does not contain {}", self.source_path))
        })?;
        Ok(FileImportResult {
            metadata: self.metadata,
            source_path: self.source_path,
            new_path: self.new_path,
            size,
            skipped,
        })
    }
}
