//! Export and import job descriptors

use serde::{Deserialize, Serialize};

use crate::error::{ErrorContext, MirrorError, Result};
use crate::image::ImageIdentity;
use crate::storage::ObjectMetadata;
use crate::types::{CorrelationId, ExporterKind, ImportKind, ModelId, User};

const META_IMPORT_KIND: &str = "mirror-import-kind";
const META_MIRRORED_MODEL: &str = "mirror-mirrored-model-id";
const META_SOURCE_MODEL: &str = "mirror-source-model-id";
const META_CORRELATION_ID: &str = "mirror-correlation-id";
const META_EXPORTER: &str = "mirror-exporter";
const META_FILE_PATH: &str = "mirror-file-path";
const META_PACKAGE_NAME: &str = "mirror-distribution-package-name";

/// One archive build + upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    /// Model being exported
    pub source_model_id: ModelId,

    /// Mirror destination, resolved from the model's mirror settings on init
    pub destination_model_id: Option<ModelId>,

    /// Which exporter builds the archive
    pub exporter_kind: ExporterKind,

    /// Caller that triggered the export
    pub initiator: User,

    /// Job identifier
    pub correlation_id: CorrelationId,
}

impl ExportJob {
    /// Create a job with a fresh correlation id
    pub fn new(source_model_id: ModelId, exporter_kind: ExporterKind, initiator: User) -> Self {
        Self {
            source_model_id,
            destination_model_id: None,
            exporter_kind,
            initiator,
            correlation_id: CorrelationId::new(),
        }
    }

    /// Use an existing correlation id (e.g. one shared by a whole-model export)
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Correlation fields attached to errors raised by this job
    pub fn error_context(&self) -> ErrorContext {
        let mut context = ErrorContext::new()
            .with("sourceModelId", &self.source_model_id)
            .with("exporter", self.exporter_kind);
        if let Some(destination) = &self.destination_model_id {
            context.insert("destinationModelId", destination);
        }
        context.with("jobId", self.correlation_id)
    }
}

/// Out-of-band description of an archive, immutable for one import job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMetadata {
    /// Importer to route the archive to
    pub import_kind: ImportKind,

    /// Model on this instance receiving the documents
    pub mirrored_model_id: ModelId,

    /// Model the archive was exported from
    pub source_model_id: ModelId,

    /// Export job that produced the archive
    pub correlation_id: CorrelationId,

    /// Exporter that produced the archive
    pub exporter: ExporterKind,

    /// Original path of the file (file imports)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,

    /// `name:tag` of the image (image imports)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_package_name: Option<String>,
}

impl ImportMetadata {
    /// Metadata for a documents archive
    pub fn documents(
        mirrored_model_id: ModelId,
        source_model_id: ModelId,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            import_kind: ImportKind::Documents,
            mirrored_model_id,
            source_model_id,
            correlation_id,
            exporter: ExporterKind::Documents,
            file_path: None,
            distribution_package_name: None,
        }
    }

    /// Metadata for a single file archive
    pub fn file(
        mirrored_model_id: ModelId,
        source_model_id: ModelId,
        correlation_id: CorrelationId,
        file_path: impl Into<String>,
    ) -> Self {
        Self {
            import_kind: ImportKind::File,
            exporter: ExporterKind::File,
            file_path: Some(file_path.into()),
            ..Self::documents(mirrored_model_id, source_model_id, correlation_id)
        }
    }

    /// Metadata for an image archive
    pub fn image(
        mirrored_model_id: ModelId,
        source_model_id: ModelId,
        correlation_id: CorrelationId,
        image: &ImageIdentity,
    ) -> Self {
        Self {
            import_kind: ImportKind::Image,
            exporter: ExporterKind::Image,
            distribution_package_name: Some(image.package_name()),
            ..Self::documents(mirrored_model_id, source_model_id, correlation_id)
        }
    }

    /// Check that the kind-specific fields are present and consistent
    pub fn validate(&self) -> Result<()> {
        if self.exporter.import_kind() != self.import_kind {
            return Err(MirrorError::Validation(format!(
                "Exporter {} cannot feed importer {}",
                self.exporter, self.import_kind
            )));
        }
        if self.mirrored_model_id == self.source_model_id {
            return Err(MirrorError::Validation(format!(
                "Mirrored model and source model must differ: {}",
                self.source_model_id
            )));
        }
        match self.import_kind {
            ImportKind::Documents => Ok(()),
            ImportKind::File => match self.file_path.as_deref() {
                Some(path) if !path.is_empty() => Ok(()),
                _ => Err(MirrorError::Validation(
                    "File import requires a file path".to_string(),
                )),
            },
            ImportKind::Image => self.image_identity().map(|_| ()),
        }
    }

    /// Image identity named by `distribution_package_name`
    pub fn image_identity(&self) -> Result<ImageIdentity> {
        let package = self.distribution_package_name.as_deref().ok_or_else(|| {
            MirrorError::Validation(
                "Image import requires a distribution package name".to_string(),
            )
        })?;
        ImageIdentity::parse(package)
    }

    /// Flatten into blob-store object metadata
    pub fn to_object_metadata(&self) -> ObjectMetadata {
        let mut metadata = ObjectMetadata::new();
        metadata.insert(META_IMPORT_KIND.to_string(), self.import_kind.to_string());
        metadata.insert(META_MIRRORED_MODEL.to_string(), self.mirrored_model_id.to_string());
        metadata.insert(META_SOURCE_MODEL.to_string(), self.source_model_id.to_string());
        metadata.insert(META_CORRELATION_ID.to_string(), self.correlation_id.to_string());
        metadata.insert(META_EXPORTER.to_string(), self.exporter.to_string());
        if let Some(path) = &self.file_path {
            metadata.insert(META_FILE_PATH.to_string(), path.clone());
        }
        if let Some(package) = &self.distribution_package_name {
            metadata.insert(META_PACKAGE_NAME.to_string(), package.clone());
        }
        metadata
    }

    /// Rebuild from blob-store object metadata, ignoring unrelated keys
    pub fn from_object_metadata(metadata: &ObjectMetadata) -> Result<Self> {
        let required = |key: &str| {
            metadata.get(key).ok_or_else(|| {
                MirrorError::Validation(format!("Missing import metadata field: {}", key))
            })
        };

        let parsed = Self {
            import_kind: required(META_IMPORT_KIND)?.parse()?,
            mirrored_model_id: required(META_MIRRORED_MODEL)?.parse()?,
            source_model_id: required(META_SOURCE_MODEL)?.parse()?,
            correlation_id: required(META_CORRELATION_ID)?.parse()?,
            exporter: required(META_EXPORTER)?.parse()?,
            file_path: metadata.get(META_FILE_PATH).cloned(),
            distribution_package_name: metadata.get(META_PACKAGE_NAME).cloned(),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Correlation fields attached to errors raised while importing
    pub fn error_context(&self) -> ErrorContext {
        ErrorContext::new()
            .with("sourceModelId", &self.source_model_id)
            .with("mirroredModelId", &self.mirrored_model_id)
            .with("jobId", self.correlation_id)
            .with("importKind", self.import_kind)
    }
}

/// One archive ingestion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportJob {
    /// Out-of-band archive description
    pub metadata: ImportMetadata,
    /// Caller on whose behalf documents are persisted
    pub initiator: User,
}

impl ImportJob {
    /// Create an import job
    pub fn new(metadata: ImportMetadata, initiator: User) -> Self {
        Self {
            metadata,
            initiator,
        }
    }
}
