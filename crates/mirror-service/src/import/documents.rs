//! Documents importer
//!
//! Entry names select the parser:
//!
//! | Entry                     | Document              |
//! |---------------------------|-----------------------|
//! | `<version>.json`          | model card revision   |
//! | `releases/<semver>.json`  | release               |
//! | `files/<id>.json`         | file record           |
//!
//! Every document must carry provenance naming the job's source model and
//! the mirrored model as destination. Releases are authorized one at a time
//! as they arrive.

use async_trait::async_trait;
use mirror_core::{
    Action, ArchivedDocument, FileRecord, ImportKind, ImportMetadata, MirrorError,
    MirroredDocument, ModelCardRevision, ParsedDocument, Release, User,
};
use mirror_gateway::ByteReader;
use semver::Version;
use tracing::{debug, info, instrument};

use super::router::EntryRouter;
use super::{read_small, Importer};
use crate::archive::EntryHeader;
use crate::context::MirrorContext;
use crate::error::ServiceResult;

/// Largest document body accepted
const MAX_DOCUMENT_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentRoute {
    CardRevision,
    Release,
    File,
}

/// What a documents import persisted
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentsSummary {
    /// Metadata of the imported archive
    pub metadata: ImportMetadata,
    /// Card revisions saved
    pub card_revisions: usize,
    /// Releases saved
    pub releases: usize,
    /// File records saved
    pub files: usize,
    /// File records left alone because the mirrored file is already complete
    pub files_skipped: usize,
}

/// Persists the documents of a documents archive onto the mirrored model
pub struct DocumentImporter {
    context: MirrorContext,
    initiator: User,
    router: EntryRouter<DocumentRoute>,
    summary: DocumentsSummary,
}

impl std::fmt::Debug for DocumentImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentImporter")
            .field("summary", &self.summary)
            .finish()
    }
}

impl DocumentImporter {
    /// Create an importer for one documents archive
    pub fn new(
        context: MirrorContext,
        metadata: ImportMetadata,
        initiator: User,
    ) -> ServiceResult<Self> {
        if metadata.import_kind != ImportKind::Documents {
            return Err(MirrorError::Validation(format!(
                "Documents importer cannot read a {} archive",
                metadata.import_kind
            )));
        }

        let router = EntryRouter::new()
            .route(r"^(\d+)\.json$", DocumentRoute::CardRevision)?
            .route(r"^releases/(.+)\.json$", DocumentRoute::Release)?
            .route(r"^files/([^/]+)\.json$", DocumentRoute::File)?;

        Ok(Self {
            context,
            initiator,
            router,
            summary: DocumentsSummary {
                metadata,
                card_revisions: 0,
                releases: 0,
                files: 0,
                files_skipped: 0,
            },
        })
    }

    fn metadata(&self) -> &ImportMetadata {
        &self.summary.metadata
    }

    /// Parse, check provenance and re-home onto the mirrored model
    fn accept<T: MirroredDocument>(&self, body: &[u8]) -> ServiceResult<T> {
        let metadata = self.metadata();
        let archived = ArchivedDocument::<T>::from_slice(body)?;
        archived.verify_source(&metadata.source_model_id)?;
        if archived.provenance.destination_model_id != metadata.mirrored_model_id {
            return Err(MirrorError::Validation(format!(
                "{} was exported for model {}, not {}",
                T::LABEL,
                archived.provenance.destination_model_id,
                metadata.mirrored_model_id
            )));
        }

        let mut document = archived.document;
        document.rehome(metadata.mirrored_model_id.clone());
        Ok(document)
    }

    fn parse(&self, route: DocumentRoute, key: &str, body: &[u8]) -> ServiceResult<ParsedDocument> {
        match route {
            DocumentRoute::CardRevision => {
                let card: ModelCardRevision = self.accept(body)?;
                let version: u32 = key.parse().map_err(|_| {
                    MirrorError::Validation(format!("Invalid card revision number {}", key))
                })?;
                if card.version != version {
                    return Err(MirrorError::Validation(format!(
                        "Entry names card revision {} but holds revision {}",
                        version, card.version
                    )));
                }
                Ok(ParsedDocument::CardRevision(card))
            }
            DocumentRoute::Release => {
                let release: Release = self.accept(body)?;
                let version = Version::parse(key)?;
                if release.semver != version {
                    return Err(MirrorError::Validation(format!(
                        "Entry names release {} but holds release {}",
                        version, release.semver
                    )));
                }
                Ok(ParsedDocument::Release(release))
            }
            DocumentRoute::File => {
                let file: FileRecord = self.accept(body)?;
                if file.id != key {
                    return Err(MirrorError::Validation(format!(
                        "Entry names file {} but holds file {}",
                        key, file.id
                    )));
                }
                Ok(ParsedDocument::File(file))
            }
        }
    }

    async fn authorize_release(&self, release: &Release) -> ServiceResult<()> {
        let decisions = self
            .context
            .authorizer
            .check_release_import(
                &self.initiator,
                &self.metadata().mirrored_model_id,
                std::slice::from_ref(release),
                Action::Import,
            )
            .await?;

        match decisions.into_iter().next() {
            Some(decision) if decision.success => Ok(()),
            Some(decision) => Err(MirrorError::Authorization(decision.info.unwrap_or_else(
                || format!("{} may not import release {}", self.initiator, release.semver),
            ))),
            None => Err(MirrorError::Internal(
                "Authorizer returned no decision for release".to_string(),
            )),
        }
    }

    async fn persist(&mut self, document: ParsedDocument) -> ServiceResult<()> {
        let store = &self.context.model_store;
        match document {
            ParsedDocument::CardRevision(card) => {
                store.save_card_revision(card).await?;
                self.summary.card_revisions += 1;
            }
            ParsedDocument::Release(release) => {
                self.authorize_release(&release).await?;
                store.save_release(release).await?;
                self.summary.releases += 1;
            }
            ParsedDocument::File(file) => {
                let existing = store.find_file_by_path(&file.path).await?;
                if existing.is_some_and(|f| f.complete) {
                    info!(path = %file.path, "File already mirrored, keeping its record");
                    self.summary.files_skipped += 1;
                } else {
                    store.save_file(file).await?;
                    self.summary.files += 1;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Importer for DocumentImporter {
    type Output = DocumentsSummary;

    fn kind(&self) -> ImportKind {
        ImportKind::Documents
    }

    #[instrument(skip(self, header, content), fields(entry = %header.name))]
    async fn process_entry(&mut self, header: &EntryHeader, content: ByteReader) -> ServiceResult<()> {
        let matched = self.router.resolve(&header.name).ok_or_else(|| {
            MirrorError::Validation(format!("Unrecognised archive entry {}", header.name))
        })?;
        let key = matched.captures.first().cloned().unwrap_or_default();

        let body = read_small(header, content, MAX_DOCUMENT_BYTES).await?;
        let document = self.parse(matched.route, &key, &body)?;
        debug!(entry = %document.entry_name(), "document accepted");
        self.persist(document).await
    }

    async fn finish(self) -> ServiceResult<DocumentsSummary> {
        info!(
            cards = self.summary.card_revisions,
            releases = self.summary.releases,
            files = self.summary.files,
            skipped = self.summary.files_skipped,
            "Documents imported"
        );
        Ok(self.summary)
    }
}
