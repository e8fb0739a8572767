//! In-memory collaborator backends
//!
//! Used by tests and local runs. Every backend records the calls it receives
//! in an ordered call log so ordering and idempotence can be asserted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirror_core::{
    Digest, FileRecord, ImageManifest, ModelCardRevision, ModelId, ObjectMetadata, Release,
    StorageLocation, User,
};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tracing::trace;

use crate::blob_store::{BlobStore, ByteReader, ObjectInfo};
use crate::error::{GatewayError, GatewayResult};
use crate::model_store::{ModelRecord, ModelStore};
use crate::registry::{
    RegistryAction, RegistryBlob, RegistryGateway, RegistryToken, TokenIssuer, UploadSession,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn read_all(mut body: ByteReader) -> GatewayResult<Vec<u8>> {
    let mut buf = Vec::new();
    body.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// A call received by [`MemoryBlobStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobStoreCall {
    /// `put_stream`
    Put(StorageLocation),
    /// `get_stream`
    Get(StorageLocation),
    /// `exists`
    Exists(StorageLocation),
    /// `delete`
    Delete(StorageLocation),
    /// `metadata`
    Metadata(StorageLocation),
}

#[derive(Debug)]
struct StoredObject {
    created: DateTime<Utc>,
    data: Vec<u8>,
    metadata: ObjectMetadata,
}

/// Blob store that keeps objects in memory
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    buckets: RwLock<HashMap<String, HashMap<String, StoredObject>>>,
    calls: Mutex<Vec<BlobStoreCall>>,
    failing_buckets: Mutex<HashSet<String>>,
}

impl MemoryBlobStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every put into `bucket` fail
    pub fn fail_writes_to(&self, bucket: impl Into<String>) {
        lock(&self.failing_buckets).insert(bucket.into());
    }

    /// Store an object directly, without logging a call
    pub async fn insert(&self, location: &StorageLocation, data: impl Into<Vec<u8>>) {
        self.insert_with_metadata(location, data, ObjectMetadata::new()).await;
    }

    /// Store an object with metadata directly, without logging a call
    pub async fn insert_with_metadata(
        &self,
        location: &StorageLocation,
        data: impl Into<Vec<u8>>,
        metadata: ObjectMetadata,
    ) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(location.bucket.clone()).or_default().insert(
            location.key.clone(),
            StoredObject {
                created: Utc::now(),
                data: data.into(),
                metadata,
            },
        );
    }

    /// Read an object's bytes directly, without logging a call
    pub async fn object(&self, location: &StorageLocation) -> Option<Vec<u8>> {
        let buckets = self.buckets.read().await;
        buckets
            .get(&location.bucket)
            .and_then(|bucket| bucket.get(&location.key))
            .map(|object| object.data.clone())
    }

    /// Keys currently stored in a bucket, sorted
    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        let buckets = self.buckets.read().await;
        let mut keys: Vec<String> = buckets
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Calls received so far
    pub fn calls(&self) -> Vec<BlobStoreCall> {
        lock(&self.calls).clone()
    }

    /// Number of `put_stream` calls received
    pub fn put_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, BlobStoreCall::Put(_)))
            .count()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: BlobStoreCall) {
        lock(&self.calls).push(call);
    }

    fn not_found(location: &StorageLocation) -> GatewayError {
        GatewayError::NotFound(format!("Object not found: {}", location))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_stream(
        &self,
        location: &StorageLocation,
        body: ByteReader,
        metadata: ObjectMetadata,
    ) -> GatewayResult<u64> {
        self.record(BlobStoreCall::Put(location.clone()));
        if lock(&self.failing_buckets).contains(&location.bucket) {
            return Err(GatewayError::Connection(format!(
                "Bucket {} is unavailable",
                location.bucket
            )));
        }

        let data = read_all(body).await?;
        let size = data.len() as u64;
        trace!(%location, size, "memory put");
        self.insert_with_metadata(location, data, metadata).await;
        Ok(size)
    }

    async fn get_stream(&self, location: &StorageLocation) -> GatewayResult<ByteReader> {
        self.record(BlobStoreCall::Get(location.clone()));
        let data = self
            .object(location)
            .await
            .ok_or_else(|| Self::not_found(location))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn exists(&self, location: &StorageLocation) -> GatewayResult<bool> {
        self.record(BlobStoreCall::Exists(location.clone()));
        Ok(self.object(location).await.is_some())
    }

    async fn delete(&self, location: &StorageLocation) -> GatewayResult<()> {
        self.record(BlobStoreCall::Delete(location.clone()));
        let mut buckets = self.buckets.write().await;
        if let Some(bucket) = buckets.get_mut(&location.bucket) {
            bucket.remove(&location.key);
        }
        Ok(())
    }

    async fn metadata(&self, location: &StorageLocation) -> GatewayResult<ObjectInfo> {
        self.record(BlobStoreCall::Metadata(location.clone()));
        let buckets = self.buckets.read().await;
        let object = buckets
            .get(&location.bucket)
            .and_then(|bucket| bucket.get(&location.key))
            .ok_or_else(|| Self::not_found(location))?;
        Ok(ObjectInfo {
            size: object.data.len() as u64,
            created: object.created,
            metadata: object.metadata.clone(),
        })
    }
}

/// A call received by [`MemoryRegistry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    /// `blob_exists`
    BlobExists {
        /// Repository
        repository: String,
        /// Blob digest
        digest: Digest,
    },
    /// `initiate_upload`
    InitiateUpload {
        /// Repository
        repository: String,
    },
    /// `upload_blob_monolithic`
    UploadBlob {
        /// Repository
        repository: String,
        /// Blob digest
        digest: Digest,
    },
    /// `cancel_upload`
    CancelUpload {
        /// Repository
        repository: String,
    },
    /// `put_manifest`
    PutManifest {
        /// Repository
        repository: String,
        /// Tag or digest
        reference: String,
    },
    /// `get_manifest`
    GetManifest {
        /// Repository
        repository: String,
        /// Tag or digest
        reference: String,
    },
    /// `get_blob`
    GetBlob {
        /// Repository
        repository: String,
        /// Blob digest
        digest: Digest,
    },
}

#[derive(Debug, Default)]
struct Repository {
    blobs: HashMap<Digest, Vec<u8>>,
    manifests: HashMap<String, ImageManifest>,
}

#[derive(Debug, Default)]
struct RegistryState {
    repositories: HashMap<String, Repository>,
    sessions: HashMap<String, String>,
}

/// Distribution registry kept in memory
///
/// Enforces token scopes, blob digests and manifest completeness the way a
/// real registry would.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: RwLock<RegistryState>,
    calls: Mutex<Vec<RegistryCall>>,
    next_session: AtomicU64,
    fail_uploads: AtomicBool,
}

impl MemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every monolithic upload fail with a server error
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Store a blob directly, without logging a call
    pub async fn insert_blob(&self, repository: &str, data: impl Into<Vec<u8>>) -> Digest {
        let data = data.into();
        let digest = Digest::sha256(&data);
        let mut state = self.state.write().await;
        state
            .repositories
            .entry(repository.to_string())
            .or_default()
            .blobs
            .insert(digest.clone(), data);
        digest
    }

    /// Store a manifest directly, without logging a call
    pub async fn insert_manifest(&self, repository: &str, reference: &str, manifest: ImageManifest) {
        let mut state = self.state.write().await;
        let repo = state.repositories.entry(repository.to_string()).or_default();
        repo.manifests
            .insert(manifest.digest().to_string(), manifest.clone());
        repo.manifests.insert(reference.to_string(), manifest);
    }

    /// Whether a blob is stored, without logging a call
    pub async fn has_blob(&self, repository: &str, digest: &Digest) -> bool {
        let state = self.state.read().await;
        state
            .repositories
            .get(repository)
            .map(|repo| repo.blobs.contains_key(digest))
            .unwrap_or(false)
    }

    /// Stored manifest, without logging a call
    pub async fn manifest(&self, repository: &str, reference: &str) -> Option<ImageManifest> {
        let state = self.state.read().await;
        state
            .repositories
            .get(repository)
            .and_then(|repo| repo.manifests.get(reference))
            .cloned()
    }

    /// Number of upload sessions still open
    pub async fn open_sessions(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    /// Calls received so far
    pub fn calls(&self) -> Vec<RegistryCall> {
        lock(&self.calls).clone()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: RegistryCall) {
        lock(&self.calls).push(call);
    }

    fn authorize(token: &RegistryToken, repository: &str, action: RegistryAction) -> GatewayResult<()> {
        if token.allows(repository, action) {
            Ok(())
        } else {
            Err(GatewayError::PermissionDenied(format!(
                "Token scope {} does not grant {} on {}",
                token.scope(),
                action,
                repository
            )))
        }
    }
}

#[async_trait]
impl RegistryGateway for MemoryRegistry {
    async fn blob_exists(
        &self,
        token: &RegistryToken,
        repository: &str,
        digest: &Digest,
    ) -> GatewayResult<bool> {
        self.record(RegistryCall::BlobExists {
            repository: repository.to_string(),
            digest: digest.clone(),
        });
        Self::authorize(token, repository, RegistryAction::Pull)?;
        Ok(self.has_blob(repository, digest).await)
    }

    async fn initiate_upload(
        &self,
        token: &RegistryToken,
        repository: &str,
    ) -> GatewayResult<UploadSession> {
        self.record(RegistryCall::InitiateUpload {
            repository: repository.to_string(),
        });
        Self::authorize(token, repository, RegistryAction::Push)?;

        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let location = format!("/v2/{}/blobs/uploads/{}", repository, id);
        let mut state = self.state.write().await;
        state.sessions.insert(location.clone(), repository.to_string());
        Ok(UploadSession {
            repository: repository.to_string(),
            location,
        })
    }

    async fn upload_blob_monolithic(
        &self,
        token: &RegistryToken,
        session: &UploadSession,
        digest: &Digest,
        body: ByteReader,
        size: u64,
    ) -> GatewayResult<()> {
        self.record(RegistryCall::UploadBlob {
            repository: session.repository.clone(),
            digest: digest.clone(),
        });
        Self::authorize(token, &session.repository, RegistryAction::Push)?;

        if !self.state.read().await.sessions.contains_key(&session.location) {
            return Err(GatewayError::Protocol {
                status: 404,
                message: format!("BLOB_UPLOAD_UNKNOWN: {}", session.location),
            });
        }
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(GatewayError::Protocol {
                status: 500,
                message: "upload failed".to_string(),
            });
        }

        let data = read_all(body).await?;
        if data.len() as u64 != size {
            return Err(GatewayError::Protocol {
                status: 400,
                message: format!("SIZE_INVALID: expected {} bytes, got {}", size, data.len()),
            });
        }
        if &Digest::sha256(&data) != digest {
            return Err(GatewayError::Protocol {
                status: 400,
                message: format!("DIGEST_INVALID: {}", digest),
            });
        }

        let mut state = self.state.write().await;
        state.sessions.remove(&session.location);
        state
            .repositories
            .entry(session.repository.clone())
            .or_default()
            .blobs
            .insert(digest.clone(), data);
        Ok(())
    }

    async fn cancel_upload(&self, token: &RegistryToken, session: &UploadSession) -> GatewayResult<()> {
        self.record(RegistryCall::CancelUpload {
            repository: session.repository.clone(),
        });
        Self::authorize(token, &session.repository, RegistryAction::Push)?;
        self.state.write().await.sessions.remove(&session.location);
        Ok(())
    }

    async fn put_manifest(
        &self,
        token: &RegistryToken,
        repository: &str,
        reference: &str,
        manifest: &ImageManifest,
    ) -> GatewayResult<Digest> {
        self.record(RegistryCall::PutManifest {
            repository: repository.to_string(),
            reference: reference.to_string(),
        });
        Self::authorize(token, repository, RegistryAction::Push)?;

        let mut state = self.state.write().await;
        let repo = state.repositories.entry(repository.to_string()).or_default();
        for digest in manifest.referenced_digests() {
            let present = if manifest.is_index() {
                repo.manifests.contains_key(&digest.to_string())
            } else {
                repo.blobs.contains_key(&digest)
            };
            if !present {
                return Err(GatewayError::Protocol {
                    status: 400,
                    message: format!("MANIFEST_BLOB_UNKNOWN: {}", digest),
                });
            }
        }

        let digest = manifest.digest();
        repo.manifests.insert(digest.to_string(), manifest.clone());
        repo.manifests.insert(reference.to_string(), manifest.clone());
        Ok(digest)
    }

    async fn get_manifest(
        &self,
        token: &RegistryToken,
        repository: &str,
        reference: &str,
    ) -> GatewayResult<ImageManifest> {
        self.record(RegistryCall::GetManifest {
            repository: repository.to_string(),
            reference: reference.to_string(),
        });
        Self::authorize(token, repository, RegistryAction::Pull)?;
        self.manifest(repository, reference).await.ok_or_else(|| {
            GatewayError::NotFound(format!("Manifest {}:{} not found", repository, reference))
        })
    }

    async fn get_blob(
        &self,
        token: &RegistryToken,
        repository: &str,
        digest: &Digest,
    ) -> GatewayResult<RegistryBlob> {
        self.record(RegistryCall::GetBlob {
            repository: repository.to_string(),
            digest: digest.clone(),
        });
        Self::authorize(token, repository, RegistryAction::Pull)?;

        let state = self.state.read().await;
        let data = state
            .repositories
            .get(repository)
            .and_then(|repo| repo.blobs.get(digest))
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("Blob {} not found", digest)))?;
        Ok(RegistryBlob {
            size: data.len() as u64,
            body: Box::new(Cursor::new(data)),
        })
    }
}

/// Token issuer that mints opaque tokens and records every scope requested
#[derive(Debug, Default)]
pub struct MemoryTokenIssuer {
    issued: Mutex<Vec<(String, Vec<RegistryAction>)>>,
}

impl MemoryTokenIssuer {
    /// Create an issuer
    pub fn new() -> Self {
        Self::default()
    }

    /// Scopes issued so far, in order
    pub fn issued(&self) -> Vec<(String, Vec<RegistryAction>)> {
        lock(&self.issued).clone()
    }
}

#[async_trait]
impl TokenIssuer for MemoryTokenIssuer {
    async fn issue(
        &self,
        user: &User,
        repository: &str,
        actions: &[RegistryAction],
    ) -> GatewayResult<RegistryToken> {
        let mut issued = lock(&self.issued);
        issued.push((repository.to_string(), actions.to_vec()));
        let value = format!("memory-{}-{}", user.dn, issued.len());
        Ok(RegistryToken::new(value, repository, actions))
    }
}

/// A write received by [`MemoryModelStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelStoreCall {
    /// `save_card_revision`
    SaveCardRevision {
        /// Owning model
        model: ModelId,
        /// Revision number
        version: u32,
    },
    /// `save_release`
    SaveRelease {
        /// Owning model
        model: ModelId,
        /// Release version
        semver: String,
    },
    /// `save_file`
    SaveFile {
        /// Owning model
        model: ModelId,
        /// File id
        id: String,
    },
    /// `mark_file_complete`
    MarkFileComplete {
        /// Object key of the file
        path: String,
    },
}

#[derive(Debug, Default)]
struct ModelState {
    models: HashMap<ModelId, ModelRecord>,
    cards: Vec<ModelCardRevision>,
    releases: Vec<Release>,
    files: Vec<FileRecord>,
}

/// Model store kept in memory
#[derive(Debug, Default)]
pub struct MemoryModelStore {
    state: RwLock<ModelState>,
    calls: Mutex<Vec<ModelStoreCall>>,
}

impl MemoryModelStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a model
    pub async fn insert_model(&self, model: ModelRecord) {
        self.state.write().await.models.insert(model.id.clone(), model);
    }

    /// Add a card revision without logging a call
    pub async fn insert_card_revision(&self, revision: ModelCardRevision) {
        upsert_card(&mut self.state.write().await.cards, revision);
    }

    /// Add a release without logging a call
    pub async fn insert_release(&self, release: Release) {
        upsert_release(&mut self.state.write().await.releases, release);
    }

    /// Add a file record without logging a call
    pub async fn insert_file(&self, file: FileRecord) {
        upsert_file(&mut self.state.write().await.files, file);
    }

    /// Writes received so far
    pub fn calls(&self) -> Vec<ModelStoreCall> {
        lock(&self.calls).clone()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: ModelStoreCall) {
        lock(&self.calls).push(call);
    }
}

fn upsert_card(cards: &mut Vec<ModelCardRevision>, revision: ModelCardRevision) {
    cards.retain(|c| !(c.model_id == revision.model_id && c.version == revision.version));
    cards.push(revision);
}

fn upsert_release(releases: &mut Vec<Release>, release: Release) {
    releases.retain(|r| !(r.model_id == release.model_id && r.semver == release.semver));
    releases.push(release);
}

fn upsert_file(files: &mut Vec<FileRecord>, file: FileRecord) {
    files.retain(|f| !(f.model_id == file.model_id && f.id == file.id));
    files.push(file);
}

#[async_trait]
impl ModelStore for MemoryModelStore {
    async fn find_model(&self, id: &ModelId) -> GatewayResult<Option<ModelRecord>> {
        Ok(self.state.read().await.models.get(id).cloned())
    }

    async fn list_card_revisions(&self, model: &ModelId) -> GatewayResult<Vec<ModelCardRevision>> {
        let mut cards: Vec<ModelCardRevision> = self
            .state
            .read()
            .await
            .cards
            .iter()
            .filter(|c| &c.model_id == model)
            .cloned()
            .collect();
        cards.sort_by_key(|c| c.version);
        Ok(cards)
    }

    async fn list_releases(&self, model: &ModelId) -> GatewayResult<Vec<Release>> {
        let mut releases: Vec<Release> = self
            .state
            .read()
            .await
            .releases
            .iter()
            .filter(|r| &r.model_id == model)
            .cloned()
            .collect();
        releases.sort_by(|a, b| a.semver.cmp(&b.semver));
        Ok(releases)
    }

    async fn list_files(&self, model: &ModelId) -> GatewayResult<Vec<FileRecord>> {
        Ok(self
            .state
            .read()
            .await
            .files
            .iter()
            .filter(|f| &f.model_id == model)
            .cloned()
            .collect())
    }

    async fn find_file(&self, model: &ModelId, file_id: &str) -> GatewayResult<Option<FileRecord>> {
        Ok(self
            .state
            .read()
            .await
            .files
            .iter()
            .find(|f| &f.model_id == model && f.id == file_id)
            .cloned())
    }

    async fn find_file_by_path(&self, path: &str) -> GatewayResult<Option<FileRecord>> {
        Ok(self
            .state
            .read()
            .await
            .files
            .iter()
            .find(|f| f.path == path)
            .cloned())
    }

    async fn save_card_revision(&self, revision: ModelCardRevision) -> GatewayResult<()> {
        self.record(ModelStoreCall::SaveCardRevision {
            model: revision.model_id.clone(),
            version: revision.version,
        });
        upsert_card(&mut self.state.write().await.cards, revision);
        Ok(())
    }

    async fn save_release(&self, release: Release) -> GatewayResult<()> {
        self.record(ModelStoreCall::SaveRelease {
            model: release.model_id.clone(),
            semver: release.semver.to_string(),
        });
        upsert_release(&mut self.state.write().await.releases, release);
        Ok(())
    }

    async fn save_file(&self, file: FileRecord) -> GatewayResult<()> {
        self.record(ModelStoreCall::SaveFile {
            model: file.model_id.clone(),
            id: file.id.clone(),
        });
        upsert_file(&mut self.state.write().await.files, file);
        Ok(())
    }

    async fn mark_file_complete(&self, path: &str) -> GatewayResult<bool> {
        self.record(ModelStoreCall::MarkFileComplete {
            path: path.to_string(),
        });
        let mut state = self.state.write().await;
        match state.files.iter_mut().find(|f| f.path == path) {
            Some(file) => {
                file.complete = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
