//! Mirroring facade
//!
//! [`MirrorService`] ties exporters, importers and the upload orchestrator
//! to one set of collaborators.

use mirror_core::{
    CorrelationId, ErrorContext, ExportJob, ExporterKind, ImageIdentity, ImportJob, ImportKind, ImportMetadata,
    MirrorError, ModelId, StorageLocation, User,
};
use mirror_gateway::{
    Authorizer, BlobStore, ByteReader, ModelStore, RegistryGateway, Signer, TokenIssuer,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::config::MirrorConfig;
use crate::context::{MirrorContext, PipelineSettings};
use crate::error::{ResultExt, ServiceResult};
use crate::export::{DocumentsExport, ExportSource, Exporter, FileExport, ImageExport};
use crate::import::{
    guard_import, run_import, DocumentImporter, FileImporter, ImageImporter, ImportOutcome,
};
use crate::integrity::{DefaultIntegrityService, IntegrityService};
use crate::upload::{UploadOrchestrator, UploadOutcome, UploadTarget};

/// One archive of a whole-model export
#[derive(Debug)]
pub struct ArchiveReport {
    /// Exporter that built the archive
    pub kind: ExporterKind,
    /// What the archive holds: the model, a file id or an image
    pub subject: String,
    /// Upload outcome, or the error that stopped the export
    pub result: ServiceResult<UploadOutcome>,
}

impl ArchiveReport {
    /// Whether the archive reached the export location
    pub fn is_uploaded(&self) -> bool {
        matches!(&self.result, Ok(outcome) if outcome.is_uploaded())
    }
}

/// Result of [`MirrorService::export_model`]
#[derive(Debug)]
pub struct ModelExportReport {
    /// Correlation id shared by every archive of the export
    pub correlation_id: CorrelationId,
    /// One report per archive, in export order
    pub archives: Vec<ArchiveReport>,
}

impl ModelExportReport {
    /// Number of archives uploaded
    pub fn uploaded(&self) -> usize {
        self.archives.iter().filter(|a| a.is_uploaded()).count()
    }

    /// Archives that were not uploaded
    pub fn failures(&self) -> impl Iterator<Item = &ArchiveReport> {
        self.archives.iter().filter(|a| !a.is_uploaded())
    }
}

/// Export and import entry points
#[derive(Debug, Clone)]
pub struct MirrorService {
    context: MirrorContext,
}

impl MirrorService {
    /// Create a service over an assembled context
    pub fn new(context: MirrorContext) -> Self {
        Self { context }
    }

    /// Start building a service
    pub fn builder() -> MirrorServiceBuilder {
        MirrorServiceBuilder::new()
    }

    /// Collaborators and settings
    pub fn context(&self) -> &MirrorContext {
        &self.context
    }

    async fn export<S: ExportSource>(&self, source: S, job: ExportJob) -> ServiceResult<UploadOutcome> {
        Exporter::new(source, job, self.context.clone()).run().await
    }

    /// Export the documents of `model`
    #[instrument(skip(self, model, initiator), fields(model = %model, user = %initiator))]
    pub async fn export_documents(
        &self,
        model: &ModelId,
        initiator: &User,
    ) -> ServiceResult<UploadOutcome> {
        let job = ExportJob::new(model.clone(), ExporterKind::Documents, initiator.clone());
        self.export(DocumentsExport, job).await
    }

    /// Export the binary of one file of `model`
    #[instrument(skip(self, model, initiator), fields(model = %model, user = %initiator))]
    pub async fn export_file(
        &self,
        model: &ModelId,
        file_id: &str,
        initiator: &User,
    ) -> ServiceResult<UploadOutcome> {
        let job = ExportJob::new(model.clone(), ExporterKind::File, initiator.clone());
        self.export(FileExport::new(file_id), job).await
    }

    /// Export one container image of `model`
    #[instrument(skip(self, model, image, initiator), fields(model = %model, user = %initiator, image = %image))]
    pub async fn export_image(
        &self,
        model: &ModelId,
        image: &ImageIdentity,
        initiator: &User,
    ) -> ServiceResult<UploadOutcome> {
        let job = ExportJob::new(model.clone(), ExporterKind::Image, initiator.clone());
        self.export(ImageExport::new(image.clone()), job).await
    }

    /// Export everything a mirror needs: documents, then every completed file
    /// attached to a release, then every image attached to a release
    ///
    /// A failing archive is reported and the remaining ones are still
    /// exported. Only failing to read the model's releases is an error.
    #[instrument(skip(self, model, initiator), fields(model = %model, user = %initiator))]
    pub async fn export_model(
        &self,
        model: &ModelId,
        initiator: &User,
    ) -> ServiceResult<ModelExportReport> {
        let correlation_id = CorrelationId::new();
        let store = &self.context.model_store;
        let releases = store.list_releases(model).await?;

        let job = |kind| {
            ExportJob::new(model.clone(), kind, initiator.clone()).with_correlation_id(correlation_id)
        };
        let mut archives = Vec::new();

        let result = self.export(DocumentsExport, job(ExporterKind::Documents)).await;
        archives.push(ArchiveReport {
            kind: ExporterKind::Documents,
            subject: model.to_string(),
            result,
        });

        let file_ids: BTreeSet<&str> = releases
            .iter()
            .flat_map(|r| r.file_ids.iter().map(String::as_str))
            .collect();
        for file_id in file_ids {
            match store.find_file(model, file_id).await? {
                Some(file) if file.complete => {}
                _ => {
                    warn!(file = file_id, "Skipping file that is missing or incomplete");
                    continue;
                }
            }
            let result = self
                .export(FileExport::new(file_id), job(ExporterKind::File))
                .await;
            archives.push(ArchiveReport {
                kind: ExporterKind::File,
                subject: file_id.to_string(),
                result,
            });
        }

        let mut images: Vec<&ImageIdentity> = Vec::new();
        for image in releases.iter().flat_map(|r| r.images.iter()) {
            if !images.contains(&image) {
                images.push(image);
            }
        }
        for image in images {
            let result = self
                .export(ImageExport::new(image.clone()), job(ExporterKind::Image))
                .await;
            archives.push(ArchiveReport {
                kind: ExporterKind::Image,
                subject: image.package_name(),
                result,
            });
        }

        let report = ModelExportReport {
            correlation_id,
            archives,
        };
        info!(
            archives = report.archives.len(),
            uploaded = report.uploaded(),
            "Model export finished"
        );
        Ok(report)
    }

    /// Import one archive stream
    #[instrument(skip(self, job, stream), fields(job = %job.metadata.correlation_id, kind = %job.metadata.import_kind))]
    pub async fn import(&self, job: ImportJob, stream: ByteReader) -> ServiceResult<ImportOutcome> {
        let job_context = job.metadata.error_context();
        guard_import(&self.context, &job)
            .await
            .context("import", &job_context)?;

        let ImportJob {
            metadata,
            initiator,
        } = job;
        let context = self.context.clone();
        let outcome = match metadata.import_kind {
            ImportKind::Documents => {
                let importer = DocumentImporter::new(context, metadata.clone(), initiator)
                    .context("import", &job_context)?;
                ImportOutcome::Documents(run_import(importer, &metadata, stream).await?)
            }
            ImportKind::File => {
                let importer = FileImporter::new(context, metadata.clone())
                    .context("import", &job_context)?;
                ImportOutcome::File(run_import(importer, &metadata, stream).await?)
            }
            ImportKind::Image => {
                let importer = ImageImporter::new(context, metadata.clone(), initiator)
                    .context("import", &job_context)?;
                ImportOutcome::Image(run_import(importer, &metadata, stream).await?)
            }
        };
        Ok(outcome)
    }

    /// Import an archive object, reading its import metadata from the
    /// object's own metadata
    #[instrument(skip(self, location, initiator), fields(location = %location, user = %initiator))]
    pub async fn import_from_store(
        &self,
        location: &StorageLocation,
        initiator: User,
    ) -> ServiceResult<ImportOutcome> {
        let blobs = &self.context.blob_store;
        let info = blobs.metadata(location).await?;
        let metadata = ImportMetadata::from_object_metadata(&info.metadata).context(
            "reading archive metadata",
            &ErrorContext::new().with("location", location),
        )?;
        let stream = blobs.get_stream(location).await?;
        self.import(ImportJob::new(metadata, initiator), stream).await
    }
}

/// Builder for [`MirrorService`]
pub struct MirrorServiceBuilder {
    model_store: Option<Arc<dyn ModelStore>>,
    blob_store: Option<Arc<dyn BlobStore>>,
    registry: Option<Arc<dyn RegistryGateway>>,
    token_issuer: Option<Arc<dyn TokenIssuer>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    integrity: Option<Arc<dyn IntegrityService>>,
    signer: Option<Arc<dyn Signer>>,
    target: UploadTarget,
    settings: PipelineSettings,
}

impl MirrorServiceBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        let defaults = MirrorConfig::default();
        Self {
            model_store: None,
            blob_store: None,
            registry: None,
            token_issuer: None,
            authorizer: None,
            integrity: None,
            signer: None,
            target: defaults.upload_target(),
            settings: defaults.pipeline_settings(),
        }
    }

    /// Take buckets, limits and the signing key from a configuration
    pub fn config(mut self, config: &MirrorConfig) -> ServiceResult<Self> {
        config.validate()?;
        self.target = config.upload_target();
        self.settings = config.pipeline_settings();
        if let Some(signer) = config.signer()? {
            self.signer = Some(Arc::new(signer));
        }
        Ok(self)
    }

    /// Set the model store
    pub fn model_store(mut self, store: Arc<dyn ModelStore>) -> Self {
        self.model_store = Some(store);
        self
    }

    /// Set the blob store
    pub fn blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    /// Set the registry gateway
    pub fn registry(mut self, registry: Arc<dyn RegistryGateway>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the registry token issuer
    pub fn token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        self.token_issuer = Some(issuer);
        self
    }

    /// Set the authorizer
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Set a custom integrity service
    pub fn integrity_service(mut self, service: Arc<dyn IntegrityService>) -> Self {
        self.integrity = Some(service);
        self
    }

    /// Sign uploaded archives
    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Set where archives are uploaded
    pub fn upload_target(mut self, target: UploadTarget) -> Self {
        self.target = target;
        self
    }

    /// Set pipeline settings
    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns an error naming the first collaborator that was not set.
    pub fn build(self) -> Result<MirrorService, String> {
        let model_store = self.model_store.ok_or("Model store is required")?;
        let blob_store = self.blob_store.ok_or("Blob store is required")?;
        let registry = self.registry.ok_or("Registry gateway is required")?;
        let token_issuer = self.token_issuer.ok_or("Token issuer is required")?;
        let authorizer = self.authorizer.ok_or("Authorizer is required")?;

        let integrity = self
            .integrity
            .unwrap_or_else(|| Arc::new(DefaultIntegrityService::new(blob_store.clone())));

        let mut uploader = UploadOrchestrator::new(blob_store.clone(), integrity, self.target);
        if let Some(signer) = self.signer {
            uploader = uploader.with_signer(signer);
        }

        Ok(MirrorService::new(MirrorContext {
            model_store,
            blob_store,
            registry,
            token_issuer,
            authorizer,
            uploader: Arc::new(uploader),
            settings: self.settings,
        }))
    }
}

impl Default for MirrorServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MirrorServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorServiceBuilder")
            .field("target", &self.target)
            .field("settings", &self.settings)
            .field("signing", &self.signer.is_some())
            .finish()
    }
}

/// Error for an export that did not upload, for callers that want `?`
pub fn require_uploaded(outcome: UploadOutcome) -> ServiceResult<UploadOutcome> {
    match outcome {
        UploadOutcome::Failed {
            name,
            stage,
            reason,
        } => Err(MirrorError::Io(format!(
            "Archive {} was not uploaded ({}): {}",
            name, stage, reason
        ))),
        uploaded => Ok(uploaded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, FILE_CONTENT};
    use mirror_core::ErrorKind;
    use mirror_gateway::{
        MemoryBlobStore, MemoryModelStore, MemoryRegistry, MemoryTokenIssuer, RbacAuthorizer,
    };

    #[test]
    fn test_builder_requires_collaborators() {
        let err = MirrorServiceBuilder::new()
            .model_store(Arc::new(MemoryModelStore::new()))
            .build()
            .unwrap_err();
        assert_eq!(err, "Blob store is required");

        let service = MirrorService::builder()
            .model_store(Arc::new(MemoryModelStore::new()))
            .blob_store(Arc::new(MemoryBlobStore::new()))
            .registry(Arc::new(MemoryRegistry::new()))
            .token_issuer(Arc::new(MemoryTokenIssuer::new()))
            .authorizer(Arc::new(RbacAuthorizer::default()))
            .build()
            .unwrap();
        assert!(!service.context().uploader.signing_enabled());
        assert_eq!(service.context().settings, PipelineSettings::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_export_then_import_from_store() {
        let fixture = fixture().await;
        let service = MirrorService::new(fixture.context.clone());
        let user = User::new("operator");

        let outcome = service.export_file(&fixture.source, "f1", &user).await.unwrap();
        let location = require_uploaded(outcome).unwrap().location().unwrap().clone();

        let mut mirrored = fixture.file_record();
        mirror_core::MirroredDocument::rehome(&mut mirrored, fixture.mirror.clone());
        fixture.model_store.insert_file(mirrored).await;

        let outcome = service.import_from_store(&location, user).await.unwrap();
        let ImportOutcome::File(result) = outcome else {
            panic!("expected a file import");
        };
        assert_eq!(result.new_path, "models/bert-mirror/files/f1");
        let stored = StorageLocation::new("model-files", "models/bert-mirror/files/f1").unwrap();
        assert_eq!(fixture.blob_store.object(&stored).await.unwrap(), FILE_CONTENT);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_export_model_reports_each_archive() {
        let fixture = fixture().await;
        let mut release = fixture.release("1.1.0");
        release.file_ids = vec!["f1".to_string(), "f-gone".to_string()];
        release.images = vec![ImageIdentity::parse("absent:v1").unwrap()];
        fixture.model_store.insert_release(release).await;

        let service = MirrorService::new(fixture.context.clone());
        let report = service
            .export_model(&fixture.source, &User::new("operator"))
            .await
            .unwrap();

        let kinds: Vec<ExporterKind> = report.archives.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![ExporterKind::Documents, ExporterKind::File, ExporterKind::Image]
        );
        assert_eq!(report.uploaded(), 2);
        let failure = report.failures().next().unwrap();
        assert_eq!(failure.subject, "absent:v1");
        assert_eq!(
            failure.result.as_ref().unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_import_requires_mirror_relationship() {
        let fixture = fixture().await;
        let service = MirrorService::new(fixture.context.clone());
        let metadata = ImportMetadata::documents(
            fixture.source.clone(),
            fixture.mirror.clone(),
            CorrelationId::new(),
        );

        let err = service
            .import(
                ImportJob::new(metadata, User::new("operator")),
                Box::new(std::io::Cursor::new(Vec::new())),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.context().get("jobId").is_some());
    }
}
