//! Test fixtures
//!
//! Documents, file binaries and a container image for the source model.

use chrono::Utc;
use mirror_core::{
    Digest, FileRecord, ImageIdentity, ImageManifest, ModelCardRevision, ModelId, Release,
    StorageLocation,
};

use super::Instance;

pub const SOURCE_MODEL: &str = "bert-base";
pub const MIRROR_MODEL: &str = "bert-mirror";
pub const CARD_SCHEMA: &str = "model-card-v2";
pub const FILES_BUCKET: &str = "model-files";

pub const WEIGHTS: &[u8] = b"weights: 0.12 0.34 0.56 0.78\n";
pub const TOKENIZER: &[u8] = b"{\"vocab_size\": 30522}";

pub const IMAGE: &str = "encoder:v1";
pub const IMAGE_CONFIG: &[u8] = b"{\"architecture\":\"amd64\"}";
pub const IMAGE_LAYER: &[u8] = b"layer: python runtime + model server";

/// Create a card revision for `model`
pub fn card(model: &ModelId, version: u32) -> ModelCardRevision {
    ModelCardRevision {
        model_id: model.clone(),
        version,
        schema_id: CARD_SCHEMA.to_string(),
        metadata: serde_json::json!({
            "overview": { "summary": format!("Revision {}", version) },
            "intendedUse": "Text classification",
        }),
        created_by: "cn=alice,ou=ml".to_string(),
        created_at: Utc::now(),
    }
}

/// Create a release of `model` carrying `file_ids` and `images`
pub fn release(model: &ModelId, semver: &str, file_ids: &[&str], images: &[&str]) -> Release {
    Release {
        model_id: model.clone(),
        semver: semver.parse().expect("Invalid semver"),
        notes: format!("Release {}", semver),
        minor: false,
        draft: false,
        file_ids: file_ids.iter().map(|id| id.to_string()).collect(),
        images: images
            .iter()
            .map(|image| ImageIdentity::parse(image).expect("Invalid image"))
            .collect(),
        created_by: "cn=alice,ou=ml".to_string(),
        created_at: Utc::now(),
    }
}

/// Create a file record whose binary lives at the model's storage path
pub fn file_record(model: &ModelId, id: &str, name: &str, content: &[u8], complete: bool) -> FileRecord {
    FileRecord {
        id: id.to_string(),
        model_id: model.clone(),
        name: name.to_string(),
        size: content.len() as u64,
        mime: "application/octet-stream".to_string(),
        path: FileRecord::storage_path(model, id),
        complete,
        created_at: Utc::now(),
    }
}

/// Location of a file binary on an instance
pub fn file_location(path: &str) -> StorageLocation {
    StorageLocation::new(FILES_BUCKET, path).expect("Invalid file location")
}

/// OCI manifest over a config blob and layers
pub fn manifest(config: (&Digest, usize), layers: &[(&Digest, usize)]) -> ImageManifest {
    let descriptor = |media_type: &str, (digest, size): (&Digest, usize)| {
        serde_json::json!({
            "mediaType": media_type,
            "digest": digest.to_string(),
            "size": size,
        })
    };
    let body = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": mirror_core::image::OCI_MANIFEST_V1,
        "config": descriptor("application/vnd.oci.image.config.v1+json", config),
        "layers": layers
            .iter()
            .map(|layer| descriptor("application/vnd.oci.image.layer.v1.tar+gzip", *layer))
            .collect::<Vec<_>>(),
    });
    ImageManifest::from_body(serde_json::to_vec(&body).expect("Failed to encode manifest"))
        .expect("Invalid manifest")
}

/// Seed the source instance
///
/// Two card revisions, releases 1.0.0 (weights + image) and 1.1.0 (weights +
/// tokenizer), a completed weights file, a tokenizer whose upload never
/// finished, and the image in the source registry.
pub async fn seed_source(instance: &Instance, model: &ModelId) {
    let store = &instance.model_store;
    for version in [1, 2] {
        store.insert_card_revision(card(model, version)).await;
    }
    store
        .insert_release(release(model, "1.0.0", &["weights"], &[IMAGE]))
        .await;
    store
        .insert_release(release(model, "1.1.0", &["weights", "tokenizer"], &[]))
        .await;

    let weights = file_record(model, "weights", "model.safetensors", WEIGHTS, true);
    instance
        .blob_store
        .insert(&file_location(&weights.path), WEIGHTS)
        .await;
    store.insert_file(weights).await;
    store
        .insert_file(file_record(model, "tokenizer", "tokenizer.json", TOKENIZER, false))
        .await;

    let image = ImageIdentity::parse(IMAGE).expect("Invalid image");
    let repository = image.repository(model);
    let config = instance.registry.insert_blob(&repository, IMAGE_CONFIG).await;
    let layer = instance.registry.insert_blob(&repository, IMAGE_LAYER).await;
    instance
        .registry
        .insert_manifest(
            &repository,
            &image.tag,
            manifest((&config, IMAGE_CONFIG.len()), &[(&layer, IMAGE_LAYER.len())]),
        )
        .await;
}
