//! The engine's top-level service object.
//!
//! One `SearchService` is constructed at startup and passed by handle to
//! everything that needs searching or indexing — there is no module-level
//! mutable state anywhere in the crate. Jobs and commands are registered
//! during setup; after that the service is shared behind `Arc` and used
//! concurrently from the orchestrator and the search path.

use anyhow::Result;
use std::sync::Arc;

use crate::commands::{CommandRegistry, StaticCommand};
use crate::config::Config;
use crate::indexer;
use crate::jobs::{Job, JobRegistry};
use crate::models::RankedResult;
use crate::progress::ProgressReporter;
use crate::search;
use crate::store::Store;
use crate::worker_manager::WorkerManager;

pub struct SearchService {
    config: Config,
    store: Arc<Store>,
    jobs: JobRegistry,
    commands: CommandRegistry,
    vectors: Arc<WorkerManager>,
}

impl SearchService {
    /// Open the store and wire up the worker manager. Jobs and commands are
    /// registered afterwards, before the first indexing run.
    pub async fn open(config: Config) -> Result<Self> {
        let store = Arc::new(Store::open(&config.db.path).await?);
        let vectors = WorkerManager::new(
            store.clone(),
            config.embedding.clone(),
            config.worker.clone(),
        );
        Ok(Self {
            config,
            store,
            jobs: JobRegistry::new(),
            commands: CommandRegistry::new(),
            vectors,
        })
    }

    pub fn register_job(&mut self, job: Arc<dyn Job>) {
        self.jobs.register(job);
    }

    pub fn register_command(&mut self, command: StaticCommand) {
        self.commands.register(command);
    }

    /// Run one indexing pass; progress is observable only through the
    /// reporter.
    pub async fn run_indexing(&self, reporter: Arc<dyn ProgressReporter>) -> Result<()> {
        indexer::run_indexing(self, reporter).await
    }

    /// Hybrid search over commands and indexed content.
    pub async fn perform_search(
        &self,
        query: &str,
        limit: usize,
        show_recent_first: bool,
    ) -> Result<Vec<RankedResult>> {
        search::perform_search(
            &self.store,
            &self.jobs,
            &self.commands,
            &self.vectors,
            &self.config.retrieval,
            query,
            limit,
            show_recent_first,
        )
        .await
    }

    /// Wipe the vector index (in memory and persisted) so the next indexing
    /// run re-embeds everything. The lexical store is untouched.
    pub async fn reset_vectors(&self) -> Result<()> {
        self.vectors.reset().await
    }

    pub async fn shutdown(&self) {
        self.vectors.shutdown().await;
        self.store.close().await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn vectors(&self) -> &Arc<WorkerManager> {
        &self.vectors
    }
}
