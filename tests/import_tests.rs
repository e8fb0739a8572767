//! Import Integration Tests
//!
//! Guards that run before any entry is applied, and what an aborted import
//! leaves behind.

mod common;

use common::{operator, Instance, TestMirror, INBOX_BUCKET};
use mirror_core::{CorrelationId, ErrorKind, ImportJob, ImportMetadata, ModelId, StorageLocation};
use mirror_gateway::{ModelRecord, ModelStoreCall};

async fn exported_documents(mirror: &TestMirror) -> Vec<u8> {
    let outcome = mirror
        .source
        .service
        .export_documents(&mirror.source_id, &operator())
        .await
        .expect("Documents export failed");
    let location = outcome.location().expect("Archive was not uploaded");
    mirror
        .source
        .blob_store
        .object(location)
        .await
        .expect("Archive missing")
}

/// Place `archive` in the destination inbox under `metadata`
async fn deliver(mirror: &TestMirror, archive: Vec<u8>, metadata: &ImportMetadata) -> StorageLocation {
    let location = StorageLocation::new(INBOX_BUCKET, "delivered.tar.gz").unwrap();
    mirror
        .destination
        .blob_store
        .insert_with_metadata(&location, archive, metadata.to_object_metadata())
        .await;
    location
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_provenance_mismatch_saves_nothing() {
    let mirror = TestMirror::new().await;
    let other_source = ModelId::new("gpt-small").unwrap();
    let other_mirror = ModelId::new("gpt-mirror").unwrap();
    mirror
        .destination
        .model_store
        .insert_model(
            ModelRecord::new(other_mirror.clone(), "GPT small (mirror)")
                .mirror_of(other_source.clone()),
        )
        .await;

    // bert-base documents presented as a gpt-small archive
    let archive = exported_documents(&mirror).await;
    let metadata = ImportMetadata::documents(other_mirror, other_source, CorrelationId::new());
    let location = deliver(&mirror, archive, &metadata).await;

    let err = mirror
        .destination
        .service
        .import_from_store(&location, operator())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.context().get("entry"), Some("1.json"));
    assert_eq!(
        err.context().get("jobId").map(str::to_string),
        Some(metadata.correlation_id.to_string())
    );
    assert!(mirror.destination.model_store.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_import_into_unknown_mirror() {
    let mirror = TestMirror::new().await;
    let archive = exported_documents(&mirror).await;
    let metadata = ImportMetadata::documents(
        ModelId::new("nowhere").unwrap(),
        mirror.source_id.clone(),
        CorrelationId::new(),
    );
    let location = deliver(&mirror, archive, &metadata).await;

    let err = mirror
        .destination
        .service
        .import_from_store(&location, operator())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(mirror.destination.model_store.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_import_requires_permission() {
    let mirror = TestMirror::with_instances(Instance::new("exporter"), Instance::new("exporter")).await;
    let archive = exported_documents(&mirror).await;
    let metadata = ImportMetadata::documents(
        mirror.mirror_id.clone(),
        mirror.source_id.clone(),
        CorrelationId::new(),
    );
    let location = deliver(&mirror, archive, &metadata).await;

    let err = mirror
        .destination
        .service
        .import_from_store(&location, operator())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert!(mirror.destination.model_store.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_archive_without_metadata_is_rejected() {
    let mirror = TestMirror::new().await;
    let archive = exported_documents(&mirror).await;
    let location = StorageLocation::new(INBOX_BUCKET, "anonymous.tar.gz").unwrap();
    mirror
        .destination
        .blob_store
        .insert(&location, archive)
        .await;

    let err = mirror
        .destination
        .service
        .import_from_store(&location, operator())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.context().get("location"), Some(location.to_string().as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_truncated_archive_keeps_earlier_entries() {
    let mirror = TestMirror::new().await;
    let mut archive = exported_documents(&mirror).await;
    archive.truncate(archive.len() / 2);
    let metadata = ImportMetadata::documents(
        mirror.mirror_id.clone(),
        mirror.source_id.clone(),
        CorrelationId::new(),
    );

    let err = mirror
        .destination
        .service
        .import(
            ImportJob::new(metadata.clone(), operator()),
            Box::new(std::io::Cursor::new(archive)),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.context().get("jobId").map(str::to_string),
        Some(metadata.correlation_id.to_string())
    );

    // Whatever was applied before the cut stays, in archive order
    let saved: Vec<ModelStoreCall> = mirror.destination.model_store.calls();
    let expected = [
        ModelStoreCall::SaveCardRevision {
            model: mirror.mirror_id.clone(),
            version: 1,
        },
        ModelStoreCall::SaveCardRevision {
            model: mirror.mirror_id.clone(),
            version: 2,
        },
    ];
    for (call, expected) in saved.iter().zip(expected.iter()) {
        assert_eq!(call, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_kind_mismatch_between_metadata_and_archive() {
    let mirror = TestMirror::new().await;
    let archive = exported_documents(&mirror).await;
    let metadata = ImportMetadata::file(
        mirror.mirror_id.clone(),
        mirror.source_id.clone(),
        CorrelationId::new(),
        "models/bert-base/files/weights",
    );
    let location = deliver(&mirror, archive, &metadata).await;

    let err = mirror
        .destination
        .service
        .import_from_store(&location, operator())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.context().get("importKind"), Some("file"));
    assert_eq!(mirror.destination.blob_store.put_count(), 0);
    assert!(mirror.destination.model_store.calls().is_empty());
}
