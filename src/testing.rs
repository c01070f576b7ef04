//! Fake collaborators for exercising the orchestrator without a network.
//!
//! `FakeExtractionService` simulates a slow job service over any number of
//! batches and records the peak number of live jobs. `ScriptedJobClient`
//! replays exact poll responses for a single job. `FakeNormalizer` records
//! how many normalizations run at once, overall and per item.

use crate::data::{JobClient, JobHandle, JobStatus, Normalizer, PollResponse, ResultItem, Symbol};
use crate::error::{ExtractionError, Result};
use crate::extraction::{Orchestrator, RunSnapshot};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

pub fn raw_html(symbol: &str, indicator: &str) -> serde_json::Value {
    json!(format!("<html><td>{} {}</td></html>", symbol, indicator))
}

struct FakeJob {
    symbols: Vec<Symbol>,
    polls: usize,
    polls_to_finish: usize,
    held: bool,
    done: bool,
}

#[derive(Default)]
struct FakeState {
    next_id: usize,
    jobs: HashMap<String, FakeJob>,
    live: usize,
    peak_live: usize,
    submissions: usize,
    hold_new_jobs: bool,
    failing: HashSet<Symbol>,
    invalidate_flags: Vec<bool>,
}

pub struct FakeExtractionService {
    indicators: Vec<String>,
    polls_to_finish: Box<dyn Fn(usize) -> usize + Send + Sync>,
    state: Mutex<FakeState>,
}

impl FakeExtractionService {
    /// Every job reports a share of its symbols per poll and resolves on
    /// poll number `polls_to_finish`.
    pub fn new(indicators: &[&str], polls_to_finish: usize) -> Self {
        Self::with_schedule(indicators, move |_| polls_to_finish)
    }

    /// Job `n` (1-based) resolves after `schedule(n)` polls.
    pub fn with_schedule(
        indicators: &[&str],
        schedule: impl Fn(usize) -> usize + Send + Sync + 'static,
    ) -> Self {
        Self {
            indicators: indicators.iter().map(|s| s.to_string()).collect(),
            polls_to_finish: Box::new(schedule),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// New jobs report no progress until released.
    pub fn hold_new_jobs(&self) {
        self.state.lock().unwrap().hold_new_jobs = true;
    }

    pub fn release(&self, job_id: &str) {
        if let Some(job) = self.state.lock().unwrap().jobs.get_mut(job_id) {
            job.held = false;
        }
    }

    pub fn release_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.hold_new_jobs = false;
        for job in state.jobs.values_mut() {
            job.held = false;
        }
    }

    /// Batches containing `symbol` are rejected at submission.
    pub fn fail_submissions_for(&self, symbol: &str) {
        self.state.lock().unwrap().failing.insert(symbol.to_string());
    }

    pub fn peak_live(&self) -> usize {
        self.state.lock().unwrap().peak_live
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().unwrap().submissions
    }

    pub fn invalidate_flags(&self) -> Vec<bool> {
        self.state.lock().unwrap().invalidate_flags.clone()
    }
}

#[async_trait]
impl JobClient for FakeExtractionService {
    async fn submit(&self, batch: &[Symbol], invalidate_cache: bool) -> Result<JobHandle> {
        {
            let mut state = self.state.lock().unwrap();
            state.live += 1;
            state.peak_live = state.peak_live.max(state.live);
        }
        tokio::task::yield_now().await;

        let mut state = self.state.lock().unwrap();
        state.submissions += 1;
        state.invalidate_flags.push(invalidate_cache);
        if batch.iter().any(|symbol| state.failing.contains(symbol)) {
            state.live -= 1;
            return Err(ExtractionError::Submission("rejected by fake".to_string()));
        }

        state.next_id += 1;
        let n = state.next_id;
        let job_id = format!("job-{}", n);
        let job = FakeJob {
            symbols: batch.to_vec(),
            polls: 0,
            polls_to_finish: (self.polls_to_finish)(n).max(1),
            held: state.hold_new_jobs,
            done: false,
        };
        state.jobs.insert(job_id.clone(), job);
        Ok(JobHandle::new(job_id, batch.len()))
    }

    async fn poll(&self, job_id: &str) -> Result<PollResponse> {
        tokio::task::yield_now().await;

        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Err(ExtractionError::Poll {
                job_id: job_id.to_string(),
                message: "unknown job".to_string(),
            });
        };

        let total = job.symbols.len();
        let completed = if job.held {
            0
        } else {
            job.polls += 1;
            (total * job.polls / job.polls_to_finish).min(total)
        };

        let mut results = HashMap::new();
        for symbol in job.symbols.iter().take(completed) {
            let items = self
                .indicators
                .iter()
                .map(|indicator| ResultItem::raw("", indicator.as_str(), raw_html(symbol, indicator)))
                .collect();
            results.insert(symbol.clone(), items);
        }

        let resolved = completed >= total;
        let finished_now = resolved && !job.done;
        if resolved {
            job.done = true;
        }
        if finished_now {
            state.live -= 1;
        }

        Ok(PollResponse {
            status: if resolved {
                JobStatus::Resolved
            } else {
                JobStatus::Pending
            },
            results,
            completed,
            total,
        })
    }
}

/// Replays a fixed sequence of poll outcomes for every job it hands out;
/// once the script runs out, the last successful response repeats.
pub struct ScriptedJobClient {
    declared_total: usize,
    script: Mutex<VecDeque<Result<PollResponse>>>,
    last: Mutex<Option<PollResponse>>,
    polls: Mutex<usize>,
}

impl ScriptedJobClient {
    pub fn new(declared_total: usize, script: Vec<Result<PollResponse>>) -> Self {
        Self {
            declared_total,
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            polls: Mutex::new(0),
        }
    }

    pub fn polls(&self) -> usize {
        *self.polls.lock().unwrap()
    }
}

#[async_trait]
impl JobClient for ScriptedJobClient {
    async fn submit(&self, _batch: &[Symbol], _invalidate_cache: bool) -> Result<JobHandle> {
        Ok(JobHandle::new("job-1", self.declared_total))
    }

    async fn poll(&self, job_id: &str) -> Result<PollResponse> {
        *self.polls.lock().unwrap() += 1;
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(response)) => {
                *self.last.lock().unwrap() = Some(response.clone());
                Ok(response)
            }
            Some(Err(err)) => Err(err),
            None => self.last.lock().unwrap().clone().ok_or(ExtractionError::Poll {
                job_id: job_id.to_string(),
                message: "script is empty".to_string(),
            }),
        }
    }
}

pub fn pending(completed: usize, total: usize, results: Vec<ResultItem>) -> PollResponse {
    poll_response(JobStatus::Pending, completed, total, results)
}

pub fn resolved(completed: usize, total: usize, results: Vec<ResultItem>) -> PollResponse {
    poll_response(JobStatus::Resolved, completed, total, results)
}

fn poll_response(
    status: JobStatus,
    completed: usize,
    total: usize,
    results: Vec<ResultItem>,
) -> PollResponse {
    let mut grouped: HashMap<Symbol, Vec<ResultItem>> = HashMap::new();
    for item in results {
        grouped.entry(item.symbol.clone()).or_default().push(item);
    }
    PollResponse {
        status,
        results: grouped,
        completed,
        total,
    }
}

#[derive(Default)]
struct NormalizerState {
    calls: usize,
    active: usize,
    peak_active: usize,
    active_per_key: HashMap<(String, String), usize>,
    peak_per_key: usize,
}

/// Answers with a small JSON document after `delay`. Content containing
/// "broken" fails.
pub struct FakeNormalizer {
    delay: Duration,
    state: Mutex<NormalizerState>,
}

impl FakeNormalizer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: Mutex::new(NormalizerState::default()),
        }
    }

    pub fn instant() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    pub fn peak_active(&self) -> usize {
        self.state.lock().unwrap().peak_active
    }

    pub fn peak_per_key(&self) -> usize {
        self.state.lock().unwrap().peak_per_key
    }
}

#[async_trait]
impl Normalizer for FakeNormalizer {
    async fn normalize(&self, content: &str, _template: &str, indicator: &str) -> Result<String> {
        let key = (content.to_string(), indicator.to_string());
        {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            state.active += 1;
            state.peak_active = state.peak_active.max(state.active);
            let per_key = state.active_per_key.entry(key.clone()).or_default();
            *per_key += 1;
            let per_key = *per_key;
            state.peak_per_key = state.peak_per_key.max(per_key);
        }

        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.active -= 1;
            if let Some(per_key) = state.active_per_key.get_mut(&key) {
                *per_key -= 1;
            }
        }

        if content.contains("broken") {
            return Err(ExtractionError::Api {
                status: 502,
                message: "upstream model error".to_string(),
            });
        }
        Ok(json!({ "indicator": indicator, "chars": content.len() }).to_string())
    }
}

/// Waits until the orchestrator publishes a snapshot matching `predicate`.
///
/// Panics after a generous timeout so a stuck scheduler fails the test
/// instead of hanging it.
pub async fn wait_for_snapshot<F>(orchestrator: &Orchestrator, predicate: F) -> RunSnapshot
where
    F: Fn(&RunSnapshot) -> bool,
{
    let mut snapshots = orchestrator.subscribe();
    let wait = async {
        loop {
            let current = snapshots.borrow_and_update().clone();
            if predicate(&current) {
                return current;
            }
            if snapshots.changed().await.is_err() {
                panic!("scheduler stopped while waiting for a snapshot");
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(600), wait)
        .await
        .expect("timed out waiting for snapshot")
}

pub async fn settle(orchestrator: &Orchestrator) {
    tokio::time::timeout(Duration::from_secs(600), orchestrator.wait_until_settled())
        .await
        .expect("timed out waiting for the run to settle");
}
