//! Core domain models and types for model mirroring
//!
//! This crate contains the data structures exchanged by the mirroring
//! pipeline: model and job identifiers, the documents carried in an archive
//! with their provenance, content digests, image manifests, storage
//! locations and the error taxonomy. It performs no I/O.

pub mod checksum;
pub mod document;
pub mod error;
pub mod image;
pub mod job;
pub mod provenance;
pub mod storage;
pub mod types;

// Re-exports for convenience
pub use checksum::{Digest, DigestHasher, HashAlgorithm};
pub use document::{
    ArchivedDocument, FileRecord, MirroredDocument, ModelCardRevision, ParsedDocument, Release,
};
pub use error::{ErrorContext, ErrorKind, MirrorError, MirrorResult, Result};
pub use image::{BlobReference, ImageIdentity, ImageManifest};
pub use job::{ExportJob, ImportJob, ImportMetadata};
pub use provenance::{MirrorProvenance, MirrorProvenanceBuilder};
pub use storage::{ObjectMetadata, StorageLocation};
pub use types::{Action, CorrelationId, ExporterKind, ImportKind, ModelId, User};
