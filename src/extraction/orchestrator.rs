use super::enrichment::EnrichmentDispatcher;
use super::progress::ProgressCounters;
use super::scheduler::{Command, RunId, RunSnapshot, RunStatus, Scheduler};
use super::store::MergeStore;
use crate::config::ExtractionConfig;
use crate::data::{JobClient, Normalizer, ResultItem, Symbol, TemplateBook};
use crate::error::{ExtractionError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Entry point of the extraction core.
///
/// Owns two background tasks: the scheduler, which drives batches through
/// submission and polling under the concurrency gate, and the enrichment
/// dispatcher, which normalizes raw HTML results as they land in the store.
/// Both stop when the orchestrator is dropped.
pub struct Orchestrator {
    config: ExtractionConfig,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<RunSnapshot>,
    store: Arc<MergeStore>,
    dispatcher: EnrichmentDispatcher,
    last_run_id: AtomicU64,
    scheduler_task: JoinHandle<()>,
    dispatcher_task: JoinHandle<()>,
}

impl Orchestrator {
    /// Starts an orchestrator with an empty merge store.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns `ExtractionError::InvalidConfig` if `config` is invalid
    pub fn spawn(
        config: ExtractionConfig,
        client: Arc<dyn JobClient>,
        normalizer: Arc<dyn Normalizer>,
        templates: TemplateBook,
    ) -> Result<Self> {
        Self::with_store(
            config,
            client,
            normalizer,
            templates,
            Arc::new(MergeStore::new()),
        )
    }

    /// Starts an orchestrator that merges into an existing store.
    ///
    /// # Errors
    /// Returns `ExtractionError::InvalidConfig` if `config` is invalid
    pub fn with_store(
        config: ExtractionConfig,
        client: Arc<dyn JobClient>,
        normalizer: Arc<dyn Normalizer>,
        templates: TemplateBook,
        store: Arc<MergeStore>,
    ) -> Result<Self> {
        config.validate()?;

        let (snapshot_tx, snapshot) = watch::channel(RunSnapshot::default());
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let scheduler = Scheduler::new(
            client,
            Arc::clone(&store),
            config.concurrency_limit,
            config.poll_interval,
            snapshot_tx,
        );
        let scheduler_task = tokio::spawn(scheduler.run(commands_rx));

        let dispatcher = EnrichmentDispatcher::new(
            Arc::clone(&store),
            normalizer,
            templates,
            config.enrichment_limit,
        );
        let dispatcher_task = dispatcher.spawn();

        Ok(Self {
            config,
            commands,
            snapshot,
            store,
            dispatcher,
            last_run_id: AtomicU64::new(0),
            scheduler_task,
            dispatcher_task,
        })
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Starts an extraction run for `symbols`.
    ///
    /// The request is queued to the scheduler and this returns at once.
    /// Batches still queued from a previous run are discarded; batches
    /// already submitted keep running and their results still merge.
    ///
    /// # Arguments
    /// * `symbols`: Stocks to extract every indicator for
    /// * `batch_size`: Symbols per remote job
    /// * `invalidate_cache`: Bypass the service cache and drop stored results
    ///   for these symbols before the run
    ///
    /// # Errors
    /// Returns `ExtractionError::InvalidConfig` for a zero batch size and
    /// `ExtractionError::Closed` if the scheduler has stopped
    pub fn start_extraction(
        &self,
        symbols: Vec<Symbol>,
        batch_size: usize,
        invalidate_cache: bool,
    ) -> Result<RunId> {
        if batch_size == 0 {
            return Err(ExtractionError::InvalidConfig(
                "batch size must be at least 1".to_string(),
            ));
        }

        let run_id = self.last_run_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.commands
            .send(Command::Start {
                run_id,
                symbols,
                batch_size,
                invalidate_cache,
            })
            .map_err(|_| ExtractionError::Closed)?;
        Ok(run_id)
    }

    /// Starts a run with the configured batch size and no invalidation.
    pub fn start(&self, symbols: Vec<Symbol>) -> Result<RunId> {
        self.start_extraction(symbols, self.config.batch_size, false)
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> RunStatus {
        self.snapshot.borrow().status
    }

    pub fn progress(&self) -> ProgressCounters {
        self.snapshot.borrow().progress
    }

    /// Receives every published snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.snapshot.clone()
    }

    pub fn store(&self) -> &Arc<MergeStore> {
        &self.store
    }

    pub fn results(&self) -> HashMap<Symbol, Vec<ResultItem>> {
        self.store.snapshot()
    }

    /// Drops every stored result.
    pub fn invalidate_store(&self) {
        self.store.clear();
    }

    pub fn enrichment_in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Whether the latest run has no work left: all of its batches are
    /// terminal and no normalization is running or waiting to start.
    pub fn is_settled(&self) -> bool {
        let snapshot = self.snapshot();
        let latest = self.last_run_id.load(Ordering::SeqCst);
        let run_done = match snapshot.run_id {
            Some(run_id) => run_id == latest && snapshot.status.is_terminal(),
            None => latest == 0,
        };

        run_done
            && self.dispatcher.in_flight() == 0
            && self.store.enrichment_candidates().is_empty()
    }

    /// Waits until [`Orchestrator::is_settled`] holds.
    ///
    /// A batch that never resolves keeps the run open, so callers wanting a
    /// deadline should wrap this in `tokio::time::timeout`.
    pub async fn wait_until_settled(&self) {
        let mut snapshots = self.snapshot.clone();
        let mut store_changes = self.store.subscribe();
        let mut in_flight = self.dispatcher.subscribe_in_flight();

        loop {
            if self.is_settled() {
                return;
            }
            tokio::select! {
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = store_changes.changed() => {}
                _ = in_flight.changed() => {}
            }
        }
    }

    /// Stops the scheduler and the dispatcher and waits for both tasks to
    /// end. Remote calls already in flight are abandoned and store changes
    /// no longer start normalizations.
    pub async fn shutdown(mut self) {
        self.scheduler_task.abort();
        self.dispatcher_task.abort();
        for task in [&mut self.scheduler_task, &mut self.dispatcher_task] {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "Background task failed during shutdown");
                }
            }
        }
        debug!("Orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.scheduler_task.abort();
        self.dispatcher_task.abort();
    }
}
