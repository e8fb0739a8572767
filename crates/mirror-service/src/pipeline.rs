//! Lifecycle of the export stream chain
//!
//! An export runs three stages concurrently: the tar writer, the gzip
//! compressor and the uploader. They are bound together: tearing one down
//! tears down all of them. [`StreamChain`] is the shared handle the stages
//! report to and the exporter destroys on failure.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One stage of the export chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Tar entry writer
    ArchiveWriter,
    /// Gzip compressor
    Compressor,
    /// Upload to the blob store
    Uploader,
}

impl Stage {
    /// All stages, upstream first
    pub const ALL: [Stage; 3] = [Stage::ArchiveWriter, Stage::Compressor, Stage::Uploader];

    fn index(self) -> usize {
        match self {
            Stage::ArchiveWriter => 0,
            Stage::Compressor => 1,
            Stage::Uploader => 2,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ArchiveWriter => "archive-writer",
            Stage::Compressor => "compressor",
            Stage::Uploader => "uploader",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Still accepting or producing data
    Open,
    /// Completed normally
    Finished,
    /// Torn down
    Destroyed,
}

#[derive(Debug)]
struct ChainState {
    stages: [StageState; 3],
    tasks: Vec<AbortHandle>,
}

#[derive(Debug)]
struct ChainInner {
    token: CancellationToken,
    state: Mutex<ChainState>,
}

/// Shared handle over the three chained stages
#[derive(Debug, Clone)]
pub struct StreamChain {
    inner: Arc<ChainInner>,
}

impl Default for StreamChain {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamChain {
    /// A chain with every stage open
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ChainInner {
                token: CancellationToken::new(),
                state: Mutex::new(ChainState {
                    stages: [StageState::Open; 3],
                    tasks: Vec::new(),
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token cancelled when the chain is destroyed
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Register a task to abort on destroy
    pub fn register_task(&self, handle: AbortHandle) {
        let mut state = self.lock();
        if state.stages.iter().any(|s| *s == StageState::Destroyed) {
            handle.abort();
        } else {
            state.tasks.push(handle);
        }
    }

    /// Mark a stage as completed; a destroyed stage stays destroyed
    pub fn finish(&self, stage: Stage) {
        let mut state = self.lock();
        let slot = &mut state.stages[stage.index()];
        if *slot == StageState::Open {
            *slot = StageState::Finished;
            debug!(%stage, "stage finished");
        }
    }

    /// Current state of a stage
    pub fn state(&self, stage: Stage) -> StageState {
        self.lock().stages[stage.index()]
    }

    /// State of every stage, upstream first
    pub fn states(&self) -> Vec<(Stage, StageState)> {
        let state = self.lock();
        Stage::ALL
            .iter()
            .map(|stage| (*stage, state.stages[stage.index()]))
            .collect()
    }

    /// Whether every stage has been torn down
    pub fn is_destroyed(&self) -> bool {
        self.lock()
            .stages
            .iter()
            .all(|s| *s == StageState::Destroyed)
    }

    /// Whether every stage completed normally
    pub fn is_finished(&self) -> bool {
        self.lock().stages.iter().all(|s| *s == StageState::Finished)
    }

    /// Tear down every stage
    ///
    /// Cancels the shared token, aborts registered tasks and marks all three
    /// stages destroyed. Idempotent.
    pub fn destroy(&self) {
        let tasks = {
            let mut state = self.lock();
            state.stages = [StageState::Destroyed; 3];
            std::mem::take(&mut state.tasks)
        };
        self.inner.token.cancel();
        for task in &tasks {
            task.abort();
        }
        debug!(aborted = tasks.len(), "stream chain destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_chain_is_open() {
        let chain = StreamChain::new();
        for (_, state) in chain.states() {
            assert_eq!(state, StageState::Open);
        }
        assert!(!chain.token().is_cancelled());
    }

    #[test]
    fn test_finish_then_destroy() {
        let chain = StreamChain::new();
        chain.finish(Stage::ArchiveWriter);
        assert_eq!(chain.state(Stage::ArchiveWriter), StageState::Finished);
        assert_eq!(chain.state(Stage::Uploader), StageState::Open);

        chain.destroy();
        assert!(chain.is_destroyed());
        assert!(chain.token().is_cancelled());

        chain.finish(Stage::Compressor);
        assert_eq!(chain.state(Stage::Compressor), StageState::Destroyed);
    }

    #[tokio::test]
    async fn test_destroy_aborts_tasks() {
        let chain = StreamChain::new();
        let task = tokio::spawn(std::future::pending::<()>());
        chain.register_task(task.abort_handle());

        chain.destroy();
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_register_after_destroy_aborts() {
        let chain = StreamChain::new();
        chain.destroy();
        let task = tokio::spawn(std::future::pending::<()>());
        chain.register_task(task.abort_handle());
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
