//! Shared fixtures for unit tests

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mirror_core::{
    Action, ArchivedDocument, Digest, ExporterKind, FileRecord, ImageManifest, MirrorProvenance,
    MirroredDocument, ModelCardRevision, ModelId, Release, StorageLocation, User,
};
use mirror_gateway::{
    AuthDecision, Authorizer, BlobStore, ByteReader, GatewayResult, MemoryBlobStore,
    MemoryModelStore, MemoryRegistry, MemoryTokenIssuer, ModelRecord, RbacAuthorizer, RbacPolicy,
};
use mockall::mock;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::archive::build_archive;
use crate::context::{MirrorContext, PipelineSettings};
use crate::integrity::DefaultIntegrityService;
use crate::pipeline::StreamChain;
use crate::upload::{UploadOrchestrator, UploadTarget};

pub const SOURCE: &str = "bert-base";
pub const MIRROR: &str = "bert-mirror";
pub const FILE_CONTENT: &[u8] = b"weights: 0.12 0.34 0.56\n";

mock! {
    pub Gatekeeper {}

    #[async_trait]
    impl Authorizer for Gatekeeper {
        async fn check_model_action(
            &self,
            user: &User,
            model: &ModelId,
            action: Action,
        ) -> GatewayResult<AuthDecision>;

        async fn check_release_import(
            &self,
            user: &User,
            model: &ModelId,
            releases: &[Release],
            action: Action,
        ) -> GatewayResult<Vec<AuthDecision>>;
    }
}

fn timestamp() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn upload_target() -> UploadTarget {
    UploadTarget {
        bucket: "mirror-exports".to_string(),
        key_prefix: "exports".to_string(),
        staging_bucket: "mirror-staging".to_string(),
        staging_prefix: "staging".to_string(),
    }
}

/// Context over empty in-memory collaborators
pub fn bare_context() -> MirrorContext {
    let blob_store = Arc::new(MemoryBlobStore::new());
    let integrity = Arc::new(DefaultIntegrityService::new(blob_store.clone()));
    MirrorContext {
        model_store: Arc::new(MemoryModelStore::new()),
        blob_store: blob_store.clone(),
        registry: Arc::new(MemoryRegistry::new()),
        token_issuer: Arc::new(MemoryTokenIssuer::new()),
        authorizer: Arc::new(RbacAuthorizer::default()),
        uploader: Arc::new(UploadOrchestrator::new(blob_store, integrity, upload_target())),
        settings: PipelineSettings::default(),
    }
}

/// A source model mirrored to a destination model, with two card revisions,
/// one release and one completed file
pub struct Fixture {
    pub source: ModelId,
    pub mirror: ModelId,
    pub model_store: Arc<MemoryModelStore>,
    pub blob_store: Arc<MemoryBlobStore>,
    pub registry: Arc<MemoryRegistry>,
    pub token_issuer: Arc<MemoryTokenIssuer>,
    pub context: MirrorContext,
}

pub async fn fixture() -> Fixture {
    let source = ModelId::new(SOURCE).unwrap();
    let mirror = ModelId::new(MIRROR).unwrap();

    let model_store = Arc::new(MemoryModelStore::new());
    let blob_store = Arc::new(MemoryBlobStore::new());
    let registry = Arc::new(MemoryRegistry::new());
    let token_issuer = Arc::new(MemoryTokenIssuer::new());

    let mut policy = RbacPolicy::new();
    policy.assign(&User::new("operator"), "mirror-operator").unwrap();

    let integrity = Arc::new(DefaultIntegrityService::new(blob_store.clone()));
    let uploader = UploadOrchestrator::new(blob_store.clone(), integrity, upload_target());
    let context = MirrorContext {
        model_store: model_store.clone(),
        blob_store: blob_store.clone(),
        registry: registry.clone(),
        token_issuer: token_issuer.clone(),
        authorizer: Arc::new(RbacAuthorizer::new(policy)),
        uploader: Arc::new(uploader),
        settings: PipelineSettings::default(),
    };

    let fixture = Fixture {
        source,
        mirror,
        model_store,
        blob_store,
        registry,
        token_issuer,
        context,
    };

    fixture
        .model_store
        .insert_model(
            ModelRecord::new(fixture.source.clone(), "BERT base")
                .with_card_schema("s1")
                .mirrored_to(fixture.mirror.clone()),
        )
        .await;
    fixture
        .model_store
        .insert_model(
            ModelRecord::new(fixture.mirror.clone(), "BERT base (mirror)")
                .mirror_of(fixture.source.clone()),
        )
        .await;
    for version in [1, 2] {
        fixture
            .model_store
            .insert_card_revision(fixture.card(version))
            .await;
    }
    fixture
        .model_store
        .insert_release(fixture.release("1.0.0"))
        .await;
    fixture.model_store.insert_file(fixture.file_record()).await;
    fixture
        .blob_store
        .insert(&fixture.file_location(), FILE_CONTENT)
        .await;

    fixture
}

impl Fixture {
    pub fn card(&self, version: u32) -> ModelCardRevision {
        ModelCardRevision {
            model_id: self.source.clone(),
            version,
            schema_id: "s1".to_string(),
            metadata: serde_json::json!({ "overview": format!("revision {}", version) }),
            created_by: "alice".to_string(),
            created_at: timestamp(),
        }
    }

    pub fn release(&self, semver: &str) -> Release {
        Release {
            model_id: self.source.clone(),
            semver: semver.parse().unwrap(),
            notes: format!("Release {}", semver),
            minor: false,
            draft: false,
            file_ids: vec!["f1".to_string()],
            images: Vec::new(),
            created_by: "alice".to_string(),
            created_at: timestamp(),
        }
    }

    pub fn file_record(&self) -> FileRecord {
        FileRecord {
            id: "f1".to_string(),
            model_id: self.source.clone(),
            name: "weights.bin".to_string(),
            size: FILE_CONTENT.len() as u64,
            mime: "application/octet-stream".to_string(),
            path: FileRecord::storage_path(&self.source, "f1"),
            complete: true,
            created_at: timestamp(),
        }
    }

    pub fn file_location(&self) -> StorageLocation {
        StorageLocation::new(
            self.context.settings.files_bucket.clone(),
            FileRecord::storage_path(&self.source, "f1"),
        )
        .unwrap()
    }

    pub async fn remove_file_binary(&self) {
        self.blob_store.delete(&self.file_location()).await.unwrap();
    }

    /// Replace the authorizer with one that answers every check with `decision`
    pub fn deny_all(&mut self, decision: AuthDecision) {
        let mut gatekeeper = MockGatekeeper::new();
        let model_decision = decision.clone();
        gatekeeper
            .expect_check_model_action()
            .returning(move |_, _, _| Ok(model_decision.clone()));
        gatekeeper
            .expect_check_release_import()
            .returning(move |_, _, releases, _| Ok(vec![decision.clone(); releases.len()]));
        self.context.authorizer = Arc::new(gatekeeper);
    }

    /// Allow model-level checks but answer release checks with `decision`
    pub fn deny_releases(&mut self, decision: AuthDecision) {
        let mut gatekeeper = MockGatekeeper::new();
        gatekeeper
            .expect_check_model_action()
            .returning(|_, _, _| Ok(AuthDecision::allow()));
        gatekeeper
            .expect_check_release_import()
            .returning(move |_, _, releases, _| Ok(vec![decision.clone(); releases.len()]));
        self.context.authorizer = Arc::new(gatekeeper);
    }
}

/// Stream of an exported archive object
pub async fn read_export(fixture: &Fixture, location: &StorageLocation) -> ByteReader {
    let data = fixture.blob_store.object(location).await.unwrap();
    Box::new(std::io::Cursor::new(data))
}

/// Serialized documents-archive entry for `document`
pub fn archived<T: MirroredDocument>(fixture: &Fixture, document: T) -> Vec<u8> {
    let provenance = MirrorProvenance::builder(
        ExporterKind::Documents,
        fixture.source.clone(),
        fixture.mirror.clone(),
    )
    .build()
    .unwrap();
    ArchivedDocument::new(document, provenance).to_bytes().unwrap()
}

/// OCI manifest whose first reference is the config blob
pub fn image_manifest(blobs: &[(&Digest, u64)]) -> ImageManifest {
    let descriptor = |(digest, size): &(&Digest, u64)| {
        serde_json::json!({
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": digest.to_string(),
            "size": size,
        })
    };
    let (config, layers) = blobs.split_first().unwrap();
    let mut config = descriptor(config);
    config["mediaType"] = "application/vnd.oci.image.config.v1+json".into();

    let body = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": mirror_core::image::OCI_MANIFEST_V1,
        "config": config,
        "layers": layers.iter().map(descriptor).collect::<Vec<_>>(),
    });
    ImageManifest::from_body(serde_json::to_vec(&body).unwrap()).unwrap()
}

/// Archive stream holding `entries` in order
pub async fn stream_of(entries: Vec<(String, Vec<u8>)>) -> ByteReader {
    let chain = StreamChain::new();
    let (mut sink, mut output, tasks) = build_archive(&chain);
    let collector = tokio::spawn(async move {
        let mut buf = Vec::new();
        output.read_to_end(&mut buf).await.map(|_| buf)
    });
    for (name, body) in entries {
        sink.add_bytes(name, body).await.unwrap();
    }
    sink.finish();
    tasks.join().await.unwrap();
    Box::new(std::io::Cursor::new(collector.await.unwrap().unwrap()))
}
