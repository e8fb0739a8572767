//! Model mirroring pipeline
//!
//! This crate moves a model's documents, file binaries and container images
//! from one registry instance to another through compressed archives.
//!
//! # Architecture
//!
//! - **Exporters** ([`export`]): read a source model and stream one archive
//!   through the archive writer, the gzip compressor and the uploader
//! - **Importers** ([`import`]): consume an archive entry by entry and
//!   re-create its content on the mirrored model
//! - **UploadOrchestrator** ([`upload`]): writes archives to the export
//!   bucket, optionally through a staging copy that is hashed and signed
//! - **MirrorService** ([`service`]): the facade tying these to one set of
//!   collaborators
//!
//! # Example
//!
//! ```rust,no_run
//! use mirror_core::{ModelId, User};
//! use mirror_gateway::{
//!     MemoryBlobStore, MemoryModelStore, MemoryRegistry, MemoryTokenIssuer, RbacAuthorizer,
//! };
//! use mirror_service::MirrorService;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = MirrorService::builder()
//!     .model_store(Arc::new(MemoryModelStore::new()))
//!     .blob_store(Arc::new(MemoryBlobStore::new()))
//!     .registry(Arc::new(MemoryRegistry::new()))
//!     .token_issuer(Arc::new(MemoryTokenIssuer::new()))
//!     .authorizer(Arc::new(RbacAuthorizer::default()))
//!     .build()?;
//!
//! let model = ModelId::new("bert-base")?;
//! let report = service.export_model(&model, &User::new("operator")).await?;
//! println!("{} archives uploaded", report.uploaded());
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod config;
pub mod context;
pub mod error;
pub mod export;
pub mod import;
pub mod integrity;
pub mod pipeline;
pub mod service;
pub mod telemetry;
pub mod upload;

#[cfg(test)]
mod test_support;

pub use archive::{build_archive, read_archive, ArchiveEntry, ArchiveReader, ArchiveSink, EntryHeader, EntryKind};
pub use config::MirrorConfig;
pub use context::{MirrorContext, PipelineSettings};
pub use error::{ResultExt, ServiceResult};
pub use export::{DocumentsExport, ExportSource, Exporter, ExporterState, FileExport, ImageExport};
pub use import::{
    DocumentImporter, DocumentsSummary, FileImportResult, FileImporter, ImageImportResult,
    ImageImporter, ImportOutcome, Importer,
};
pub use integrity::{DefaultIntegrityService, IntegrityService};
pub use pipeline::{Stage, StageState, StreamChain};
pub use service::{ArchiveReport, MirrorService, MirrorServiceBuilder, ModelExportReport};
pub use upload::{UploadOrchestrator, UploadOutcome, UploadStage, UploadTarget};
