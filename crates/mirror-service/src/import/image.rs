//! Image importer
//!
//! Replays an image archive into the registry repository of the mirrored
//! model. Blobs are pushed as their entries arrive; the manifest is buffered
//! and committed only when the archive ends, after every blob it references
//! is known to be present.

use async_trait::async_trait;
use mirror_core::{
    Digest, HashAlgorithm, ImageIdentity, ImageManifest, ImportKind, ImportMetadata, MirrorError,
    User,
};
use mirror_gateway::{ByteReader, RegistryAction, RegistryGateway, RegistryToken, UploadSession};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

use super::router::EntryRouter;
use super::{read_small, Importer};
use crate::archive::EntryHeader;
use crate::context::MirrorContext;
use crate::error::ServiceResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageRoute {
    Manifest,
    Blob,
}

async fn cancel_session(registry: &dyn RegistryGateway, token: &RegistryToken, session: &UploadSession) {
    if let Err(e) = registry.cancel_upload(token, session).await {
        warn!(error = %e, session = %session.location, "Failed to cancel upload session");
    }
}

/// Upload session that is cancelled unless the blob lands
///
/// Dropping it while still armed, for example when the import is abandoned
/// mid-upload, cancels the session on a background task.
struct PendingUpload {
    registry: Arc<dyn RegistryGateway>,
    token: RegistryToken,
    session: UploadSession,
    armed: bool,
}

impl PendingUpload {
    fn new(registry: Arc<dyn RegistryGateway>, token: RegistryToken, session: UploadSession) -> Self {
        Self {
            registry,
            token,
            session,
            armed: true,
        }
    }

    fn complete(mut self) {
        self.armed = false;
    }

    async fn cancel(mut self) {
        self.armed = false;
        cancel_session(self.registry.as_ref(), &self.token, &self.session).await;
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(session = %self.session.location, "Upload session abandoned outside a runtime");
            return;
        };
        debug!(session = %self.session.location, "cancelling abandoned upload session");
        let registry = self.registry.clone();
        let token = self.token.clone();
        let session = self.session.clone();
        handle.spawn(async move {
            cancel_session(registry.as_ref(), &token, &session).await;
        });
    }
}

/// Result of an image import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageImportResult {
    /// Metadata of the imported archive
    pub metadata: ImportMetadata,
    /// Imported image
    pub image: ImageIdentity,
    /// Repository the image was pushed to
    pub repository: String,
    /// Digest the registry stored the manifest under
    pub manifest_digest: Digest,
    /// Blobs pushed
    pub blobs_uploaded: usize,
    /// Blobs already present on the registry
    pub blobs_skipped: usize,
}

/// Pushes the blobs and manifest of an image archive
pub struct ImageImporter {
    context: MirrorContext,
    metadata: ImportMetadata,
    initiator: User,
    image: ImageIdentity,
    repository: String,
    router: EntryRouter<ImageRoute>,
    pull_token: Option<RegistryToken>,
    push_token: Option<RegistryToken>,
    manifest: Option<ImageManifest>,
    blobs: HashSet<Digest>,
    uploaded: usize,
    skipped: usize,
}

impl std::fmt::Debug for ImageImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageImporter")
            .field("image", &self.image)
            .field("repository", &self.repository)
            .field("manifest", &self.manifest.is_some())
            .field("blobs", &self.blobs.len())
            .finish()
    }
}

impl ImageImporter {
    /// Create an importer for one image archive
    pub fn new(
        context: MirrorContext,
        metadata: ImportMetadata,
        initiator: User,
    ) -> ServiceResult<Self> {
        if metadata.import_kind != ImportKind::Image {
            return Err(MirrorError::Validation(format!(
                "Image importer cannot read a {} archive",
                metadata.import_kind
            )));
        }
        let image = metadata.image_identity()?;
        let repository = image.repository(&metadata.mirrored_model_id);
        let content_dir = regex::escape(&image.package_name());
        let router = EntryRouter::new()
            .route(&format!("^{}/manifest\\.json$", content_dir), ImageRoute::Manifest)?
            .route(
                &format!("^{}/blobs/sha256/([0-9a-f]{{64}})$", content_dir),
                ImageRoute::Blob,
            )?;

        Ok(Self {
            context,
            metadata,
            initiator,
            image,
            repository,
            router,
            pull_token: None,
            push_token: None,
            manifest: None,
            blobs: HashSet::new(),
            uploaded: 0,
            skipped: 0,
        })
    }

    /// Repository blobs and manifest are pushed to
    pub fn repository(&self) -> &str {
        &self.repository
    }

    async fn pull_token(&mut self) -> ServiceResult<RegistryToken> {
        if let Some(token) = &self.pull_token {
            return Ok(token.clone());
        }
        let token = self
            .context
            .token_issuer
            .issue(&self.initiator, &self.repository, RegistryAction::PULL)
            .await?;
        self.pull_token = Some(token.clone());
        Ok(token)
    }

    async fn push_token(&mut self) -> ServiceResult<RegistryToken> {
        if let Some(token) = &self.push_token {
            return Ok(token.clone());
        }
        let token = self
            .context
            .token_issuer
            .issue(&self.initiator, &self.repository, RegistryAction::PUSH_PULL)
            .await?;
        self.push_token = Some(token.clone());
        Ok(token)
    }

    async fn handle_blob(
        &mut self,
        header: &EntryHeader,
        hex: &str,
        mut content: ByteReader,
    ) -> ServiceResult<()> {
        let digest = Digest::new(HashAlgorithm::SHA256, hex)?;
        if !self.blobs.insert(digest.clone()) {
            debug!(%digest, "duplicate blob entry");
            tokio::io::copy(&mut content, &mut tokio::io::sink()).await?;
            return Ok(());
        }

        let pull = self.pull_token().await?;
        if self
            .context
            .registry
            .blob_exists(&pull, &self.repository, &digest)
            .await?
        {
            tokio::io::copy(&mut content, &mut tokio::io::sink()).await?;
            info!(%digest, "Blob already present");
            self.skipped += 1;
            return Ok(());
        }

        let push = self.push_token().await?;
        let session = self
            .context
            .registry
            .initiate_upload(&push, &self.repository)
            .await?;
        let pending = PendingUpload::new(self.context.registry.clone(), push.clone(), session);
        if let Err(e) = self
            .context
            .registry
            .upload_blob_monolithic(&push, &pending.session, &digest, content, header.size)
            .await
        {
            pending.cancel().await;
            return Err(e.into());
        }
        pending.complete();

        debug!(%digest, size = header.size, "blob uploaded");
        self.uploaded += 1;
        Ok(())
    }

    async fn handle_manifest(&mut self, header: &EntryHeader, content: ByteReader) -> ServiceResult<()> {
        if self.manifest.is_some() {
            return Err(MirrorError::Validation(format!(
                "Archive holds more than one manifest for {}",
                self.image
            )));
        }
        let limit = self.context.settings.max_manifest_bytes as u64;
        let body = read_small(header, content, limit).await?;
        let manifest = ImageManifest::from_body(body)?;
        if manifest.is_index() {
            return Err(MirrorError::Validation(format!(
                "Manifest of {} is an index ({}); only single manifests can be mirrored",
                self.image,
                manifest.media_type()
            )));
        }
        debug!(references = manifest.references().len(), "manifest buffered");
        self.manifest = Some(manifest);
        Ok(())
    }
}

#[async_trait]
impl Importer for ImageImporter {
    type Output = ImageImportResult;

    fn kind(&self) -> ImportKind {
        ImportKind::Image
    }

    #[instrument(skip(self, header, content), fields(entry = %header.name, repository = %self.repository))]
    async fn process_entry(
        &mut self,
        header: &EntryHeader,
        content: ByteReader,
    ) -> ServiceResult<()> {
        let matched = self.router.resolve(&header.name).ok_or_else(|| {
            MirrorError::Validation(format!("Unrecognised archive entry {}", header.name))
        })?;

        match matched.route {
            ImageRoute::Manifest => self.handle_manifest(header, content).await,
            ImageRoute::Blob => {
                let hex = matched.captures.first().cloned().unwrap_or_default();
                self.handle_blob(header, &hex, content).await
            }
        }
    }

    async fn finish(mut self) -> ServiceResult<ImageImportResult> {
        let manifest = self.manifest.take().ok_or_else(|| {
            MirrorError::Validation(format!("Archive holds no manifest for {}", self.image))
        })?;

        let unseen: Vec<Digest> = manifest
            .referenced_digests()
            .into_iter()
            .filter(|digest| !self.blobs.contains(digest))
            .collect();
        if !unseen.is_empty() {
            let pull = self.pull_token().await?;
            for digest in unseen {
                if !self
                    .context
                    .registry
                    .blob_exists(&pull, &self.repository, &digest)
                    .await?
                {
                    return Err(MirrorError::Protocol {
                        status: 404,
                        message: format!(
                            "Blob {} referenced by the manifest of {} is missing",
                            digest, self.image
                        ),
                    });
                }
            }
        }

        let push = self.push_token().await?;
        let manifest_digest = self
            .context
            .registry
            .put_manifest(&push, &self.repository, &self.image.tag, &manifest)
            .await?;
        info!(
            image = %self.image,
            %manifest_digest,
            uploaded = self.uploaded,
            skipped = self.skipped,
            "Image imported"
        );

        Ok(ImageImportResult {
            metadata: self.metadata,
            image: self.image,
            repository: self.repository,
            manifest_digest,
            blobs_uploaded: self.uploaded,
            blobs_skipped: self.skipped,
        })
    }
}
