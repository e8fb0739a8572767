//! Export Integration Tests
//!
//! Archive multiplicity, stream-chain cleanup and export guards.

mod common;

use common::{fixtures, operator, Instance, TestMirror};
use mirror_core::{ErrorKind, ExportJob, ExporterKind, User};
use mirror_gateway::BlobStore;
use mirror_service::{Exporter, ExporterState, FileExport, StageState};
use std::collections::HashSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_model_export_produces_one_archive_per_subject() {
    let mirror = TestMirror::new().await;

    let report = mirror
        .source
        .service
        .export_model(&mirror.source_id, &operator())
        .await
        .expect("Model export failed");

    let subjects: Vec<(ExporterKind, &str)> = report
        .archives
        .iter()
        .map(|a| (a.kind, a.subject.as_str()))
        .collect();
    assert_eq!(
        subjects,
        vec![
            (ExporterKind::Documents, fixtures::SOURCE_MODEL),
            (ExporterKind::File, "weights"),
            (ExporterKind::Image, fixtures::IMAGE),
        ]
    );
    assert_eq!(report.uploaded(), 3);

    let keys = mirror.source.blob_store.keys("mirror-exports").await;
    assert_eq!(keys.len(), 3);
    assert_eq!(keys.iter().collect::<HashSet<_>>().len(), 3);
    let correlation_id = report.correlation_id.to_string();
    for key in &keys {
        assert!(key.starts_with("exports/"), "unexpected key {}", key);
        assert!(key.contains(&correlation_id), "key {} lacks the job id", key);
        assert!(key.ends_with(".tar.gz"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_model_export_continues_past_failures() {
    let mirror = TestMirror::new().await;
    mirror
        .source
        .blob_store
        .delete(&fixtures::file_location("models/bert-base/files/weights"))
        .await
        .unwrap();

    let report = mirror
        .source
        .service
        .export_model(&mirror.source_id, &operator())
        .await
        .expect("Model export failed");

    assert_eq!(report.archives.len(), 3);
    assert_eq!(report.uploaded(), 2);
    let failed: Vec<&str> = report.failures().map(|a| a.subject.as_str()).collect();
    assert_eq!(failed, vec!["weights"]);
    assert_eq!(
        report.failures().next().unwrap().result.as_ref().unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert!(report.archives[2].is_uploaded());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_incomplete_file_is_not_exported() {
    let mirror = TestMirror::new().await;

    let err = mirror
        .source
        .service
        .export_file(&mirror.source_id, "tokenizer", &operator())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(mirror
        .source
        .blob_store
        .keys("mirror-exports")
        .await
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_export_requires_permission() {
    let mirror = TestMirror::with_instances(Instance::new("importer"), Instance::new("importer")).await;

    let err = mirror
        .source
        .service
        .export_documents(&mirror.source_id, &operator())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let err = mirror
        .source
        .service
        .export_documents(&mirror.source_id, &User::new("cn=stranger"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert_eq!(err.context().get("sourceModelId"), Some(fixtures::SOURCE_MODEL));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_source_destroys_every_stage() {
    let mirror = TestMirror::new().await;
    let job = ExportJob::new(mirror.source_id.clone(), ExporterKind::File, operator());
    let mut exporter = Exporter::new(
        FileExport::new("weights"),
        job,
        mirror.source.service.context().clone(),
    );
    exporter.init().await.expect("Export init failed");

    mirror
        .source
        .blob_store
        .delete(&fixtures::file_location("models/bert-base/files/weights"))
        .await
        .unwrap();

    let err = exporter.add_data().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(exporter.state(), ExporterState::Failed);
    for (stage, state) in exporter.chain().states() {
        assert_eq!(state, StageState::Destroyed, "stage {} not destroyed", stage);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_export_is_torn_down() {
    let mirror = TestMirror::new().await;
    let job = ExportJob::new(mirror.source_id.clone(), ExporterKind::Documents, operator());
    let mut exporter = Exporter::new(
        mirror_service::DocumentsExport,
        job,
        mirror.source.service.context().clone(),
    );
    exporter.init().await.expect("Export init failed");
    let chain = exporter.chain().clone();
    assert!(!chain.is_destroyed());

    drop(exporter);
    assert!(chain.is_destroyed());
    assert!(chain.token().is_cancelled());
}
