//! Upload orchestration for export archives
//!
//! Unsigned archives stream straight to the export location. Signed archives
//! take a detour through a staging object: the digest needs the whole
//! content before the final write can start, and the archive stream can only
//! be read once.
//!
//! Export failures never propagate out of [`UploadOrchestrator::upload`];
//! they are logged and reported as [`UploadOutcome::Failed`].

use mirror_core::{Digest, MirrorError, ObjectMetadata, StorageLocation};
use mirror_gateway::{BlobStore, ByteReader, Signature, Signer};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::integrity::IntegrityService;

/// Object metadata key holding the base64 signature
pub const SIGNATURE_METADATA_KEY: &str = "mirror-signature";
/// Object metadata key holding the signing key id
pub const SIGNATURE_KEY_ID_METADATA_KEY: &str = "mirror-signature-key-id";
/// Object metadata key holding the signed archive digest
pub const DIGEST_METADATA_KEY: &str = "mirror-archive-digest";

/// Step of an upload that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    /// Direct write of an unsigned archive
    Direct,
    /// Write to the staging location
    Staging,
    /// Re-read of the staged object for its digest
    Digest,
    /// Signature request
    Signing,
    /// Re-read of the staged object and write to the export location
    FinalUpload,
    /// The export was torn down before the upload settled
    Cancelled,
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStage::Direct => "direct",
            UploadStage::Staging => "staging",
            UploadStage::Digest => "digest",
            UploadStage::Signing => "signing",
            UploadStage::FinalUpload => "final-upload",
            UploadStage::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// How an upload settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The archive is at its export location
    Uploaded {
        /// Export location
        location: StorageLocation,
        /// Archive size in bytes
        size: u64,
        /// Digest the signature covers
        digest: Option<Digest>,
        /// Detached signature, when signing is enabled
        signature: Option<Signature>,
    },
    /// The upload failed; nothing was written to the export location
    Failed {
        /// Archive name
        name: String,
        /// Step that failed
        stage: UploadStage,
        /// Failure description
        reason: String,
    },
}

impl UploadOutcome {
    /// Outcome of an upload torn down with its export
    pub fn cancelled(name: impl Into<String>) -> Self {
        UploadOutcome::Failed {
            name: name.into(),
            stage: UploadStage::Cancelled,
            reason: "export stream chain destroyed".to_string(),
        }
    }

    /// Whether the archive reached the export location
    pub fn is_uploaded(&self) -> bool {
        matches!(self, UploadOutcome::Uploaded { .. })
    }

    /// Export location, if uploaded
    pub fn location(&self) -> Option<&StorageLocation> {
        match self {
            UploadOutcome::Uploaded { location, .. } => Some(location),
            UploadOutcome::Failed { .. } => None,
        }
    }
}

/// Where archives are written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// Export bucket
    pub bucket: String,
    /// Key prefix inside the export bucket
    pub key_prefix: String,
    /// Staging bucket for signed uploads
    pub staging_bucket: String,
    /// Key prefix inside the staging bucket
    pub staging_prefix: String,
}

impl UploadTarget {
    /// Export location of an archive
    pub fn destination(&self, name: &str) -> Result<StorageLocation, MirrorError> {
        StorageLocation::under(self.bucket.clone(), &self.key_prefix, name)
    }

    /// Staging location of an archive
    pub fn staging(&self, name: &str) -> Result<StorageLocation, MirrorError> {
        StorageLocation::under(self.staging_bucket.clone(), &self.staging_prefix, name)
    }
}

type StageResult<T> = Result<T, (UploadStage, MirrorError)>;

fn at<E: Into<MirrorError>>(stage: UploadStage) -> impl FnOnce(E) -> (UploadStage, MirrorError) {
    move |e| (stage, e.into())
}

/// Chooses between direct and signed double upload
pub struct UploadOrchestrator {
    blob_store: Arc<dyn BlobStore>,
    integrity: Arc<dyn IntegrityService>,
    signer: Option<Arc<dyn Signer>>,
    target: UploadTarget,
}

impl UploadOrchestrator {
    /// Create an orchestrator with signing disabled
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        integrity: Arc<dyn IntegrityService>,
        target: UploadTarget,
    ) -> Self {
        Self {
            blob_store,
            integrity,
            signer: None,
            target,
        }
    }

    /// Enable signing
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Whether uploads are signed
    pub fn signing_enabled(&self) -> bool {
        self.signer.is_some()
    }

    /// Where archives are written
    pub fn target(&self) -> &UploadTarget {
        &self.target
    }

    /// Upload an archive stream under `name`
    ///
    /// Never fails: any error is logged with its stage and returned as
    /// [`UploadOutcome::Failed`].
    #[instrument(skip(self, body, metadata), fields(name = %name, signed = self.signer.is_some()))]
    pub async fn upload(
        &self,
        name: &str,
        body: ByteReader,
        metadata: ObjectMetadata,
    ) -> UploadOutcome {
        let result = match &self.signer {
            None => self.direct_upload(name, body, metadata.clone()).await,
            Some(signer) => {
                self.signed_upload(name, body, metadata.clone(), signer.as_ref())
                    .await
            }
        };

        match result {
            Ok(outcome) => {
                if let Some(location) = outcome.location() {
                    info!(%location, "Archive uploaded");
                }
                outcome
            }
            Err((stage, err)) => {
                let location = self
                    .target
                    .destination(name)
                    .map(|l| l.to_string())
                    .unwrap_or_else(|_| name.to_string());
                error!(
                    %stage,
                    %location,
                    error = %err,
                    metadata = ?metadata,
                    "Archive upload failed"
                );
                UploadOutcome::Failed {
                    name: name.to_string(),
                    stage,
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn direct_upload(
        &self,
        name: &str,
        body: ByteReader,
        metadata: ObjectMetadata,
    ) -> StageResult<UploadOutcome> {
        let location = self.target.destination(name).map_err(at(UploadStage::Direct))?;
        let size = self
            .blob_store
            .put_stream(&location, body, metadata)
            .await
            .map_err(at(UploadStage::Direct))?;

        Ok(UploadOutcome::Uploaded {
            location,
            size,
            digest: None,
            signature: None,
        })
    }

    async fn signed_upload(
        &self,
        name: &str,
        body: ByteReader,
        metadata: ObjectMetadata,
        signer: &dyn Signer,
    ) -> StageResult<UploadOutcome> {
        let staging = self.target.staging(name).map_err(at(UploadStage::Staging))?;
        let result = match self
            .blob_store
            .put_stream(&staging, body, metadata.clone())
            .await
        {
            Ok(_) => self.sign_and_publish(name, &staging, metadata, signer).await,
            Err(e) => Err((UploadStage::Staging, e.into())),
        };

        if let Err(e) = self.blob_store.delete(&staging).await {
            warn!(%staging, error = %e, "Failed to remove staged archive");
        }
        result
    }

    async fn sign_and_publish(
        &self,
        name: &str,
        staging: &StorageLocation,
        mut metadata: ObjectMetadata,
        signer: &dyn Signer,
    ) -> StageResult<UploadOutcome> {
        let (digest, staged_size) = self
            .integrity
            .digest_object(staging)
            .await
            .map_err(at(UploadStage::Digest))?;

        let digest_bytes = digest.to_bytes().map_err(at(UploadStage::Digest))?;
        let signature = signer
            .sign(&digest_bytes)
            .await
            .map_err(at(UploadStage::Signing))?;

        metadata.insert(SIGNATURE_METADATA_KEY.to_string(), signature.to_base64());
        metadata.insert(
            SIGNATURE_KEY_ID_METADATA_KEY.to_string(),
            signature.key_id.clone(),
        );
        metadata.insert(DIGEST_METADATA_KEY.to_string(), digest.to_string());

        let location = self
            .target
            .destination(name)
            .map_err(at(UploadStage::FinalUpload))?;
        let body = self
            .blob_store
            .get_stream(staging)
            .await
            .map_err(at(UploadStage::FinalUpload))?;
        let size = self
            .blob_store
            .put_stream(&location, body, metadata)
            .await
            .map_err(at(UploadStage::FinalUpload))?;

        if size != staged_size {
            return Err((
                UploadStage::FinalUpload,
                MirrorError::Io(format!(
                    "Staged archive changed size: digested {} bytes, uploaded {}",
                    staged_size, size
                )),
            ));
        }

        Ok(UploadOutcome::Uploaded {
            location,
            size,
            digest: Some(digest),
            signature: Some(signature),
        })
    }
}
