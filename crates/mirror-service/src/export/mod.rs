//! Exporters
//!
//! An [`Exporter`] builds one archive for one [`ExportJob`] and hands the
//! compressed stream to the [`UploadOrchestrator`](crate::upload::UploadOrchestrator)
//! while it is still being written. What goes into the archive is decided by
//! its [`ExportSource`]: model documents, one file binary or one container
//! image.
//!
//! Lifecycle: `Uninitialized -> Initialised -> Populating -> Finalised`, or
//! `Failed` from any step. `init` checks preconditions and authorization
//! before wiring any stream; `add_data` and `finalise` tear the whole stream
//! chain down on failure.

pub mod documents;
pub mod file;
pub mod image;

pub use documents::DocumentsExport;
pub use file::FileExport;
pub use image::ImageExport;

use async_trait::async_trait;
use mirror_core::{
    Action, ExportJob, ExporterKind, ImportMetadata, MirrorError, MirrorProvenance,
    ModelId,
};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::archive::{build_archive, ArchiveSink, ArchiveTasks};
use crate::context::MirrorContext;
use crate::error::{task_failure, ServiceResult};
use crate::pipeline::{Stage, StreamChain};
use crate::upload::UploadOutcome;

/// Exporter lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterState {
    /// Created, `init` not yet called
    Uninitialized,
    /// Guards passed and streams wired
    Initialised,
    /// Entries are being written
    Populating,
    /// Archive complete and upload settled
    Finalised,
    /// A step failed; the stream chain is destroyed
    Failed,
}

/// What a job is exporting, as seen by a source
#[derive(Debug, Clone, Copy)]
pub struct ExportScope<'a> {
    /// The job
    pub job: &'a ExportJob,
    /// Resolved mirror destination
    pub destination: &'a ModelId,
    /// Collaborators
    pub context: &'a MirrorContext,
}

impl ExportScope<'_> {
    /// Provenance block stamped onto every exported document
    pub fn provenance(&self) -> ServiceResult<MirrorProvenance> {
        MirrorProvenance::builder(
            self.job.exporter_kind,
            self.job.source_model_id.clone(),
            self.destination.clone(),
        )
        .correlation_id(self.job.correlation_id)
        .build()
    }
}

/// Kind-specific part of an export
#[async_trait]
pub trait ExportSource: Send + Sync {
    /// Exporter kind
    fn kind(&self) -> ExporterKind;

    /// Check kind-specific preconditions and describe the archive for the importer
    async fn prepare(&self, scope: &ExportScope<'_>) -> ServiceResult<ImportMetadata>;

    /// Object name of the archive
    fn archive_name(&self, job: &ExportJob) -> String;

    /// Write every entry; returns the number of entries written
    async fn add_data(&self, scope: &ExportScope<'_>, sink: &mut ArchiveSink)
        -> ServiceResult<usize>;
}

struct Wiring {
    sink: Option<ArchiveSink>,
    tasks: ArchiveTasks,
    upload: JoinHandle<UploadOutcome>,
}

/// Builds and uploads one archive
pub struct Exporter<S: ExportSource> {
    source: S,
    job: ExportJob,
    context: MirrorContext,
    chain: StreamChain,
    state: ExporterState,
    metadata: Option<ImportMetadata>,
    wiring: Option<Wiring>,
    entries: usize,
}

impl<S: ExportSource> Exporter<S> {
    /// Create an exporter for `job`
    pub fn new(source: S, job: ExportJob, context: MirrorContext) -> Self {
        Self {
            source,
            job,
            context,
            chain: StreamChain::new(),
            state: ExporterState::Uninitialized,
            metadata: None,
            wiring: None,
            entries: 0,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ExporterState {
        self.state
    }

    /// The stream chain the exporter drives
    pub fn chain(&self) -> &StreamChain {
        &self.chain
    }

    /// The job, with its destination once `init` succeeded
    pub fn job(&self) -> &ExportJob {
        &self.job
    }

    /// Out-of-band description of the archive, once `init` succeeded
    pub fn import_metadata(&self) -> Option<&ImportMetadata> {
        self.metadata.as_ref()
    }

    fn require_state(&self, allowed: &[ExporterState], operation: &str) -> ServiceResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(MirrorError::IllegalState(format!(
                "{} called while the exporter is {:?}",
                operation, self.state
            )))
        }
    }

    /// Export enabled, model present, destination configured, card schema selected
    async fn guard_preconditions(&self) -> ServiceResult<ModelId> {
        if !self.context.settings.export_enabled {
            return Err(MirrorError::Validation(
                "Exports are disabled on this instance".to_string(),
            ));
        }

        let model = self
            .context
            .model_store
            .find_model(&self.job.source_model_id)
            .await?
            .ok_or_else(|| {
                MirrorError::NotFound(format!("Model {} not found", self.job.source_model_id))
            })?;

        let destination = model.mirror.destination_model_id.ok_or_else(|| {
            MirrorError::Validation(format!(
                "Model {} has no mirror destination configured",
                model.id
            ))
        })?;

        if model.card_schema_id.is_none() {
            return Err(MirrorError::Validation(format!(
                "Model {} has no classification schema selected",
                model.id
            )));
        }

        Ok(destination)
    }

    async fn guard_auth(&self) -> ServiceResult<()> {
        let decision = self
            .context
            .authorizer
            .check_model_action(&self.job.initiator, &self.job.source_model_id, Action::Export)
            .await?;
        if decision.success {
            Ok(())
        } else {
            Err(MirrorError::Authorization(decision.info.unwrap_or_else(|| {
                format!(
                    "{} may not export model {}",
                    self.job.initiator, self.job.source_model_id
                )
            })))
        }
    }

    async fn run_guards(&self) -> ServiceResult<(ModelId, ImportMetadata)> {
        let destination = self.guard_preconditions().await?;
        self.guard_auth().await?;
        let scope = ExportScope {
            job: &self.job,
            destination: &destination,
            context: &self.context,
        };
        let metadata = self.source.prepare(&scope).await?;
        Ok((destination, metadata))
    }

    fn wire_streams(&mut self, metadata: &ImportMetadata) {
        let (sink, archive, tasks) = build_archive(&self.chain);
        let name = self.source.archive_name(&self.job);
        let uploader = self.context.uploader.clone();
        let object_metadata = metadata.to_object_metadata();
        let chain = self.chain.clone();
        let token = self.chain.token();

        let upload = tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = uploader.upload(&name, archive, object_metadata) => outcome,
                _ = token.cancelled() => UploadOutcome::cancelled(name.clone()),
            };
            if outcome.is_uploaded() {
                chain.finish(Stage::Uploader);
            }
            outcome
        });
        self.chain.register_task(upload.abort_handle());

        self.wiring = Some(Wiring {
            sink: Some(sink),
            tasks,
            upload,
        });
    }

    /// Check preconditions and authorization, then wire the stream chain
    ///
    /// Nothing is wired when a guard fails.
    #[instrument(skip(self), fields(job = %self.job.correlation_id, model = %self.job.source_model_id, kind = %self.source.kind()))]
    pub async fn init(&mut self) -> ServiceResult<()> {
        self.require_state(&[ExporterState::Uninitialized], "init")
            .map_err(|e| e.with_context("init export", self.job.error_context()))?;

        match self.run_guards().await {
            Ok((destination, metadata)) => {
                self.job.destination_model_id = Some(destination);
                self.wire_streams(&metadata);
                self.metadata = Some(metadata);
                self.state = ExporterState::Initialised;
                info!(destination = ?self.job.destination_model_id, "Export initialised");
                Ok(())
            }
            Err(e) => {
                self.state = ExporterState::Failed;
                warn!(error = %e, "Export rejected");
                Err(e.with_context("init export", self.job.error_context()))
            }
        }
    }

    async fn populate(&mut self) -> ServiceResult<usize> {
        let destination = self.job.destination_model_id.clone().ok_or_else(|| {
            MirrorError::IllegalState("export destination was not resolved".to_string())
        })?;
        let sink = self
            .wiring
            .as_mut()
            .and_then(|w| w.sink.as_mut())
            .ok_or_else(|| MirrorError::IllegalState("archive streams are not wired".to_string()))?;
        let scope = ExportScope {
            job: &self.job,
            destination: &destination,
            context: &self.context,
        };
        self.source.add_data(&scope, sink).await
    }

    /// Write the archive entries
    #[instrument(skip(self), fields(job = %self.job.correlation_id))]
    pub async fn add_data(&mut self) -> ServiceResult<usize> {
        if let Err(e) = self.require_state(&[ExporterState::Initialised], "add_data") {
            return Err(self.fail("add data", e).await);
        }
        self.state = ExporterState::Populating;

        match self.populate().await {
            Ok(written) => {
                self.entries += written;
                Ok(written)
            }
            Err(e) => Err(self.fail("add data", e).await),
        }
    }

    /// Close the archive and wait for the upload to settle
    ///
    /// An upload failure is reported through the returned outcome, not as
    /// an error.
    #[instrument(skip(self), fields(job = %self.job.correlation_id))]
    pub async fn finalise(&mut self) -> ServiceResult<UploadOutcome> {
        if let Err(e) = self.require_state(
            &[ExporterState::Initialised, ExporterState::Populating],
            "finalise",
        ) {
            return Err(self.fail("finalise", e).await);
        }
        let Some(Wiring { sink, tasks, upload }) = self.wiring.take() else {
            let err = MirrorError::IllegalState("archive streams are not wired".to_string());
            return Err(self.fail("finalise", err).await);
        };

        if let Some(sink) = sink {
            sink.finish();
        }
        let stages = tasks.join().await;
        let outcome = upload.await.map_err(|e| task_failure(e, "uploader"));

        match (stages, outcome) {
            (_, Ok(outcome @ UploadOutcome::Failed { .. })) => {
                self.chain.destroy();
                self.state = ExporterState::Failed;
                warn!(?outcome, "Export archive was not uploaded");
                Ok(outcome)
            }
            (Ok(()), Ok(outcome)) => {
                self.state = ExporterState::Finalised;
                info!(entries = self.entries, location = ?outcome.location(), "Export finalised");
                Ok(outcome)
            }
            (Err(e), _) | (_, Err(e)) => Err(self.fail("finalise", e).await),
        }
    }

    /// `init`, `add_data` and `finalise` in sequence
    pub async fn run(mut self) -> ServiceResult<UploadOutcome> {
        self.init().await?;
        self.add_data().await?;
        self.finalise().await
    }

    async fn fail(&mut self, operation: &str, err: MirrorError) -> MirrorError {
        self.chain.destroy();
        self.state = ExporterState::Failed;

        let mut context = self.job.error_context();
        if let Some(wiring) = self.wiring.take() {
            drop(wiring.sink);
            if wiring.upload.is_finished() {
                if let Ok(UploadOutcome::Failed { stage, reason, .. }) = wiring.upload.await {
                    context.insert("uploadStage", stage);
                    context.insert("uploadError", reason);
                }
            }
        }

        error!(operation, error = %err, context = %context, "Export failed");
        err.with_context(operation, context)
    }
}

impl<S: ExportSource> Drop for Exporter<S> {
    fn drop(&mut self) {
        if matches!(
            self.state,
            ExporterState::Initialised | ExporterState::Populating
        ) {
            self.chain.destroy();
        }
    }
}

impl<S: ExportSource> std::fmt::Debug for Exporter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("kind", &self.source.kind())
            .field("job", &self.job)
            .field("state", &self.state)
            .field("entries", &self.entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageState;
    use crate::test_support::{fixture, Fixture, SOURCE};
    use mirror_core::{ErrorKind, User};
    use mirror_gateway::{AuthDecision, ModelRecord};

    fn job(fixture: &Fixture) -> ExportJob {
        ExportJob::new(
            fixture.source.clone(),
            ExporterKind::Documents,
            User::new("operator"),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_lifecycle() {
        let fixture = fixture().await;
        let mut exporter = Exporter::new(DocumentsExport, job(&fixture), fixture.context.clone());
        assert_eq!(exporter.state(), ExporterState::Uninitialized);

        exporter.init().await.unwrap();
        assert_eq!(exporter.state(), ExporterState::Initialised);
        assert_eq!(
            exporter.job().destination_model_id.as_ref(),
            Some(&fixture.mirror)
        );

        exporter.add_data().await.unwrap();
        let outcome = exporter.finalise().await.unwrap();

        assert!(outcome.is_uploaded());
        assert_eq!(exporter.state(), ExporterState::Finalised);
        assert!(exporter.chain().is_finished());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_add_data_before_init_is_illegal() {
        let fixture = fixture().await;
        let mut exporter = Exporter::new(DocumentsExport, job(&fixture), fixture.context.clone());

        let err = exporter.add_data().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        assert!(!err.is_retryable());
        assert!(exporter.chain().is_destroyed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_destination_fails_init() {
        let fixture = fixture().await;
        let lonely = ModelId::new("lonely").unwrap();
        fixture
            .model_store
            .insert_model(ModelRecord::new(lonely.clone(), "Lonely").with_card_schema("s1"))
            .await;

        let job = ExportJob::new(lonely, ExporterKind::Documents, User::new("operator"));
        let mut exporter = Exporter::new(DocumentsExport, job, fixture.context.clone());
        let err = exporter.init().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(exporter.state(), ExporterState::Failed);
        for (_, state) in exporter.chain().states() {
            assert_eq!(state, StageState::Open);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_schema_fails_init() {
        let fixture = fixture().await;
        let bare = ModelId::new("bare").unwrap();
        fixture
            .model_store
            .insert_model(ModelRecord::new(bare.clone(), "Bare").mirrored_to(fixture.mirror.clone()))
            .await;

        let job = ExportJob::new(bare, ExporterKind::Documents, User::new("operator"));
        let err = Exporter::new(DocumentsExport, job, fixture.context.clone())
            .init()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_denied_export() {
        let mut fixture = fixture().await;
        fixture.deny_all(AuthDecision::deny("not an exporter"));

        let mut exporter = Exporter::new(DocumentsExport, job(&fixture), fixture.context.clone());
        let err = exporter.init().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert!(err.to_string().contains("not an exporter"));
        assert_eq!(err.context().get("sourceModelId"), Some(SOURCE));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exports_disabled() {
        let mut fixture = fixture().await;
        fixture.context.settings.export_enabled = false;

        let err = Exporter::new(DocumentsExport, job(&fixture), fixture.context.clone())
            .init()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_finalise_is_illegal() {
        let fixture = fixture().await;
        let mut exporter = Exporter::new(DocumentsExport, job(&fixture), fixture.context.clone());
        exporter.init().await.unwrap();
        exporter.finalise().await.unwrap();

        let err = exporter.finalise().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_source_destroys_chain() {
        let fixture = fixture().await;
        let job = ExportJob::new(
            fixture.source.clone(),
            ExporterKind::File,
            User::new("operator"),
        );
        let missing = FileExport::new("f-missing");
        let mut exporter = Exporter::new(missing, job, fixture.context.clone());

        let err = exporter.init().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let job = ExportJob::new(
            fixture.source.clone(),
            ExporterKind::File,
            User::new("operator"),
        );
        let mut exporter = Exporter::new(FileExport::new("f1"), job, fixture.context.clone());
        exporter.init().await.unwrap();
        fixture.remove_file_binary().await;

        let err = exporter.add_data().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(exporter.state(), ExporterState::Failed);
        assert!(exporter.chain().is_destroyed());
        assert!(err.context().get("jobId").is_some());
    }
}
