//! Common test utilities and helpers
//!
//! A [`TestMirror`] is a pair of in-memory registry instances: `source` owns
//! the model and `destination` owns its mirror. Archives exported on one side
//! reach the other through [`TestMirror::transfer`], the way an operator
//! copies them between sites.

#![allow(dead_code)]

use mirror_core::{ModelId, StorageLocation, User};
use mirror_gateway::{
    BlobStore, MemoryBlobStore, MemoryModelStore, MemoryRegistry, MemoryTokenIssuer, ModelRecord,
    RbacAuthorizer, RbacPolicy, Signer,
};
use mirror_service::MirrorService;
use std::sync::Arc;

pub mod fixtures;

/// Bucket the destination reads transferred archives from
pub const INBOX_BUCKET: &str = "mirror-inbox";

/// One registry instance backed by in-memory collaborators
pub struct Instance {
    pub model_store: Arc<MemoryModelStore>,
    pub blob_store: Arc<MemoryBlobStore>,
    pub registry: Arc<MemoryRegistry>,
    pub token_issuer: Arc<MemoryTokenIssuer>,
    pub service: MirrorService,
}

impl Instance {
    /// Create an instance where `operator` holds `role`
    pub fn new(role: &str) -> Self {
        Self::build(role, None)
    }

    /// Create an instance that signs its exports
    pub fn signing(role: &str, signer: Arc<dyn Signer>) -> Self {
        Self::build(role, Some(signer))
    }

    fn build(role: &str, signer: Option<Arc<dyn Signer>>) -> Self {
        let model_store = Arc::new(MemoryModelStore::new());
        let blob_store = Arc::new(MemoryBlobStore::new());
        let registry = Arc::new(MemoryRegistry::new());
        let token_issuer = Arc::new(MemoryTokenIssuer::new());

        let mut policy = RbacPolicy::new();
        policy
            .assign(&operator(), role)
            .expect("Failed to assign role");

        let mut builder = MirrorService::builder()
            .model_store(model_store.clone())
            .blob_store(blob_store.clone())
            .registry(registry.clone())
            .token_issuer(token_issuer.clone())
            .authorizer(Arc::new(RbacAuthorizer::new(policy)));
        if let Some(signer) = signer {
            builder = builder.signer(signer);
        }
        let service = builder.build().expect("Failed to build mirror service");

        Self {
            model_store,
            blob_store,
            registry,
            token_issuer,
            service,
        }
    }
}

/// Source and destination instances with a configured mirror relationship
pub struct TestMirror {
    pub source_id: ModelId,
    pub mirror_id: ModelId,
    pub source: Instance,
    pub destination: Instance,
}

impl TestMirror {
    /// A seeded source model and an empty mirror on the destination
    pub async fn new() -> Self {
        Self::with_instances(Instance::new("exporter"), Instance::new("importer")).await
    }

    /// Seed the given instances
    pub async fn with_instances(source: Instance, destination: Instance) -> Self {
        let source_id = ModelId::new(fixtures::SOURCE_MODEL).expect("Invalid model id");
        let mirror_id = ModelId::new(fixtures::MIRROR_MODEL).expect("Invalid model id");

        source
            .model_store
            .insert_model(
                ModelRecord::new(source_id.clone(), "BERT base")
                    .with_card_schema(fixtures::CARD_SCHEMA)
                    .mirrored_to(mirror_id.clone()),
            )
            .await;
        destination
            .model_store
            .insert_model(
                ModelRecord::new(mirror_id.clone(), "BERT base (mirror)")
                    .with_card_schema(fixtures::CARD_SCHEMA)
                    .mirror_of(source_id.clone()),
            )
            .await;

        fixtures::seed_source(&source, &source_id).await;

        Self {
            source_id,
            mirror_id,
            source,
            destination,
        }
    }

    /// Copy an exported archive, with its object metadata, into the
    /// destination's inbox
    pub async fn transfer(&self, location: &StorageLocation) -> StorageLocation {
        let data = self
            .source
            .blob_store
            .object(location)
            .await
            .expect("Exported archive not found");
        let info = self
            .source
            .blob_store
            .metadata(location)
            .await
            .expect("Failed to read archive metadata");

        let inbox = StorageLocation::new(INBOX_BUCKET, location.file_name())
            .expect("Invalid inbox location");
        self.destination
            .blob_store
            .insert_with_metadata(&inbox, data, info.metadata)
            .await;
        inbox
    }
}

/// The user every instance grants a role to
pub fn operator() -> User {
    User::new("cn=operator,ou=ml")
}
