use crate::error::{ExtractionError, Result};
use std::time::Duration;

/// Default number of batches allowed to be submitting or polling at once.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 5;

/// Default number of symbols per remote extraction job.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default delay between two poll rounds.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Tunables for an extraction orchestrator.
///
/// # Fields
/// * `concurrency_limit`: Upper bound on batches submitting plus batches polling
/// * `batch_size`: Default symbols per batch when a run does not override it
/// * `poll_interval`: Fixed delay between poll rounds for active jobs
/// * `enrichment_limit`: Optional bound on concurrent normalization calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionConfig {
    pub concurrency_limit: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub enrichment_limit: Option<usize>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            enrichment_limit: None,
        }
    }
}

impl ExtractionConfig {
    /// Checks that every bound is usable.
    ///
    /// # Errors
    /// Returns `ExtractionError::InvalidConfig` if the concurrency limit, batch
    /// size, poll interval or enrichment limit is zero
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(ExtractionError::InvalidConfig(
                "concurrency limit must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ExtractionError::InvalidConfig(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ExtractionError::InvalidConfig(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.enrichment_limit == Some(0) {
            return Err(ExtractionError::InvalidConfig(
                "enrichment limit must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}
