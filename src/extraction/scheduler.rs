//! Batch lifecycle state machine.
//!
//! One task owns every batch record, the pending queue, the concurrency
//! gate and the current run's progress. Remote calls run in spawned tasks
//! that report back over a channel, so all lifecycle state is mutated from
//! a single place:
//!
//! ```text
//! Queued --submit--> Submitting --accepted--> Polling --terminal poll--> Resolved
//!                         |                    ^    |
//!                         +--rejected--> Failed     +-- poll tick (self loop)
//! ```
//!
//! Every transition into `Resolved` or `Failed` runs an admission pass, so
//! freed capacity is reused right away.

use super::gate::ConcurrencyGate;
use super::progress::{BatchContribution, ProgressAggregator, ProgressCounters};
use super::splitter::{split, Batch};
use super::store::MergeStore;
use crate::data::{JobClient, JobHandle, JobStatus, PollResponse, Symbol};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

pub type BatchId = u64;
pub type RunId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    Queued,
    Submitting,
    Polling,
    Resolved,
    Failed,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Resolved | BatchState::Failed)
    }
}

/// Status of the most recently started run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Initializing,
    Polling,
    /// Every batch is terminal; some may have failed.
    Completed,
    /// Every batch failed at submission.
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error)
    }
}

/// Observable state of the orchestrator.
///
/// `queued`, `submitting` and `polling` count batches of every run still in
/// flight; `progress`, `status` and `failed_batches` describe the current run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub run_id: Option<RunId>,
    pub status: RunStatus,
    pub progress: ProgressCounters,
    pub queued: usize,
    pub submitting: usize,
    pub polling: usize,
    pub failed_batches: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub(crate) enum Command {
    Start {
        run_id: RunId,
        symbols: Vec<Symbol>,
        batch_size: usize,
        invalidate_cache: bool,
    },
}

#[derive(Debug)]
enum Event {
    Submitted {
        batch_id: BatchId,
        result: Result<JobHandle>,
    },
    Polled {
        batch_id: BatchId,
        result: Result<PollResponse>,
    },
}

#[derive(Debug)]
struct BatchRecord {
    run_id: RunId,
    batch: Batch,
    invalidate_cache: bool,
    state: BatchState,
    handle: Option<JobHandle>,
    completed: usize,
    total: usize,
    poll_in_flight: bool,
}

impl BatchRecord {
    fn contribution(&self) -> BatchContribution {
        match self.state {
            BatchState::Queued | BatchState::Submitting => BatchContribution::Pending {
                symbols: self.batch.len(),
            },
            BatchState::Polling | BatchState::Resolved => BatchContribution::Reported {
                completed: self.completed,
                total: self.total,
            },
            BatchState::Failed => BatchContribution::Dropped,
        }
    }
}

#[derive(Debug)]
struct RunBook {
    id: RunId,
    batch_ids: Vec<BatchId>,
    progress: ProgressAggregator,
    status: RunStatus,
    failed_batches: usize,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

pub(crate) struct Scheduler {
    client: Arc<dyn JobClient>,
    store: Arc<MergeStore>,
    poll_interval: Duration,
    gate: ConcurrencyGate,
    pending: VecDeque<BatchId>,
    batches: HashMap<BatchId, BatchRecord>,
    run: Option<RunBook>,
    next_batch_id: BatchId,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    snapshot: watch::Sender<RunSnapshot>,
}

impl Scheduler {
    pub(crate) fn new(
        client: Arc<dyn JobClient>,
        store: Arc<MergeStore>,
        concurrency_limit: usize,
        poll_interval: Duration,
        snapshot: watch::Sender<RunSnapshot>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            client,
            store,
            poll_interval,
            gate: ConcurrencyGate::new(concurrency_limit),
            pending: VecDeque::new(),
            batches: HashMap::new(),
            run: None,
            next_batch_id: 0,
            events_tx,
            events_rx,
            snapshot,
        }
    }

    /// Processes commands, remote call outcomes and poll ticks until the
    /// command channel closes.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("Command channel closed, stopping scheduler");
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = ticker.tick() => self.poll_active(),
            }
            self.publish();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                run_id,
                symbols,
                batch_size,
                invalidate_cache,
            } => self.start_run(run_id, symbols, batch_size, invalidate_cache),
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Submitted { batch_id, result } => self.on_submitted(batch_id, result),
            Event::Polled { batch_id, result } => self.on_polled(batch_id, result),
        }
    }

    fn current_run_id(&self) -> Option<RunId> {
        self.run.as_ref().map(|run| run.id)
    }

    fn start_run(
        &mut self,
        run_id: RunId,
        symbols: Vec<Symbol>,
        batch_size: usize,
        invalidate_cache: bool,
    ) {
        let batches = match split(&symbols, batch_size) {
            Ok(batches) => batches,
            Err(err) => {
                warn!(run_id, error = %err, "Ignoring extraction request");
                return;
            }
        };

        // Queued work of the previous run is dropped; its submitting and
        // polling batches keep running and merging.
        let dropped = self.pending.len();
        for batch_id in self.pending.drain(..) {
            self.batches.remove(&batch_id);
        }
        self.batches.retain(|_, record| !record.state.is_terminal());
        if dropped > 0 {
            info!(dropped, "Discarded queued batches of the previous run");
        }

        if invalidate_cache {
            let removed = self.store.invalidate_symbols(&symbols);
            debug!(run_id, removed, "Invalidated stored results");
        }

        let mut batch_ids = Vec::with_capacity(batches.len());
        for batch in batches {
            self.next_batch_id += 1;
            let batch_id = self.next_batch_id;
            self.batches.insert(
                batch_id,
                BatchRecord {
                    run_id,
                    batch,
                    invalidate_cache,
                    state: BatchState::Queued,
                    handle: None,
                    completed: 0,
                    total: 0,
                    poll_in_flight: false,
                },
            );
            self.pending.push_back(batch_id);
            batch_ids.push(batch_id);
        }

        info!(
            run_id,
            symbols = symbols.len(),
            batches = batch_ids.len(),
            "Starting extraction run"
        );

        self.run = Some(RunBook {
            id: run_id,
            batch_ids,
            progress: ProgressAggregator::new(),
            status: RunStatus::Initializing,
            failed_batches: 0,
            started_at: Utc::now(),
            finished_at: None,
        });

        self.admit();
        self.refresh_run();
    }

    /// Moves queued batches to `Submitting` while the gate has free slots.
    fn admit(&mut self) {
        while self.gate.available_slots() > 0 {
            let Some(batch_id) = self.pending.pop_front() else {
                break;
            };
            let Some(record) = self.batches.get_mut(&batch_id) else {
                continue;
            };
            if !self.gate.begin_submission() {
                self.pending.push_front(batch_id);
                break;
            }

            record.state = BatchState::Submitting;
            let client = Arc::clone(&self.client);
            let events = self.events_tx.clone();
            let batch = record.batch.clone();
            let invalidate_cache = record.invalidate_cache;
            debug!(batch_id, symbols = batch.len(), "Submitting batch");

            tokio::spawn(async move {
                let result = client.submit(batch.symbols(), invalidate_cache).await;
                // The scheduler owns the receiver; a send only fails during shutdown
                let _ = events.send(Event::Submitted { batch_id, result });
            });
        }
    }

    fn on_submitted(&mut self, batch_id: BatchId, result: Result<JobHandle>) {
        let Some(record) = self.batches.get_mut(&batch_id) else {
            warn!(batch_id, "Submission finished for an unknown batch");
            return;
        };

        match result {
            Ok(handle) => {
                self.gate.submission_succeeded();
                info!(
                    batch_id,
                    job_id = %handle.id,
                    declared_total = handle.declared_total,
                    "Batch accepted"
                );
                record.total = handle.declared_total;
                record.handle = Some(handle);
                record.state = BatchState::Polling;
            }
            Err(err) => {
                self.gate.submission_failed();
                warn!(
                    batch_id,
                    symbols = record.batch.len(),
                    error = %err,
                    "Batch submission failed"
                );
                record.state = BatchState::Failed;
                self.retire_if_stale(batch_id);
            }
        }

        self.admit();
        self.refresh_run();
    }

    /// Issues one poll per active job that has no poll outstanding.
    fn poll_active(&mut self) {
        for (&batch_id, record) in self.batches.iter_mut() {
            if record.state != BatchState::Polling || record.poll_in_flight {
                continue;
            }
            let Some(handle) = record.handle.as_ref() else {
                continue;
            };

            record.poll_in_flight = true;
            let job_id = handle.id.clone();
            let client = Arc::clone(&self.client);
            let events = self.events_tx.clone();
            debug!(batch_id, job_id = %job_id, "Polling job");

            tokio::spawn(async move {
                let result = client.poll(&job_id).await;
                let _ = events.send(Event::Polled { batch_id, result });
            });
        }
    }

    fn on_polled(&mut self, batch_id: BatchId, result: Result<PollResponse>) {
        let Some(record) = self.batches.get_mut(&batch_id) else {
            return;
        };
        record.poll_in_flight = false;
        if record.state != BatchState::Polling {
            return;
        }
        let Some(handle) = record.handle.as_ref() else {
            warn!(batch_id, "Polling batch has no job handle");
            return;
        };
        let job_id = handle.id.clone();

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(batch_id, job_id = %job_id, error = %err, "Poll failed, retrying next tick");
                return;
            }
        };

        record.completed = record.completed.max(response.completed);
        record.total = record.total.max(response.total);
        // Counts are judged against the declared total too, so a job that
        // has not counted its work yet (0/0) is not taken as finished
        let terminal = response.status == JobStatus::Resolved
            || (record.total > 0 && record.completed >= record.total);
        debug!(
            batch_id,
            job_id = %job_id,
            completed = response.completed,
            total = response.total,
            "Poll response"
        );

        for (symbol, items) in response.results {
            self.store.merge(&symbol, items);
        }

        if terminal {
            record.state = BatchState::Resolved;
            self.gate.batch_resolved();
            info!(batch_id, job_id = %job_id, "Batch resolved");
            self.retire_if_stale(batch_id);
            self.admit();
        }

        self.refresh_run();
    }

    /// Forgets a terminal batch that belongs to an earlier run.
    fn retire_if_stale(&mut self, batch_id: BatchId) {
        let current = self.current_run_id();
        let stale = self
            .batches
            .get(&batch_id)
            .map(|record| record.state.is_terminal() && Some(record.run_id) != current)
            .unwrap_or(false);
        if stale {
            self.batches.remove(&batch_id);
        }
    }

    /// Recomputes progress and status of the current run.
    fn refresh_run(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };

        let records: Vec<&BatchRecord> = run
            .batch_ids
            .iter()
            .filter_map(|batch_id| self.batches.get(batch_id))
            .collect();

        run.progress
            .observe(records.iter().map(|record| record.contribution()));
        run.failed_batches = records
            .iter()
            .filter(|record| record.state == BatchState::Failed)
            .count();

        let all_terminal = records.iter().all(|record| record.state.is_terminal());
        let any_accepted = records.iter().any(|record| {
            matches!(record.state, BatchState::Polling | BatchState::Resolved)
        });

        let status = if all_terminal {
            if !records.is_empty() && run.failed_batches == records.len() {
                RunStatus::Error
            } else {
                RunStatus::Completed
            }
        } else if any_accepted {
            RunStatus::Polling
        } else {
            RunStatus::Initializing
        };

        if status.is_terminal() && !run.status.is_terminal() {
            run.finished_at = Some(Utc::now());
            let progress = run.progress.current();
            info!(
                run_id = run.id,
                status = ?status,
                completed = progress.completed,
                total = progress.total,
                failed_batches = run.failed_batches,
                "Extraction run finished"
            );
        }
        run.status = status;
    }

    fn publish(&self) {
        let next = match &self.run {
            Some(run) => RunSnapshot {
                run_id: Some(run.id),
                status: run.status,
                progress: run.progress.current(),
                queued: self.pending.len(),
                submitting: self.gate.in_flight_submitting(),
                polling: self.gate.active_polling(),
                failed_batches: run.failed_batches,
                started_at: Some(run.started_at),
                finished_at: run.finished_at,
            },
            None => RunSnapshot::default(),
        };

        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}
