use serde::Serialize;

/// Overall progress of one extraction run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressCounters {
    pub completed: usize,
    pub total: usize,
}

impl ProgressCounters {
    /// Completed share in `[0, 1]`; an empty run counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.completed as f64 / self.total as f64).min(1.0)
    }
}

/// What one batch of the current run contributes to progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchContribution {
    /// Queued or submitting: no job counters yet, every symbol counts as
    /// outstanding work.
    Pending { symbols: usize },
    /// Polling or resolved: the job's own counters.
    Reported { completed: usize, total: usize },
    /// Failed at submission: dropped from the run.
    Dropped,
}

/// Folds per-batch counters into one figure that never moves backwards.
///
/// `completed` is the sum of reported completions; `total` is the sum of
/// reported totals plus outstanding symbols, but never less than a total
/// already shown, so a failed or re-estimated batch does not shrink the
/// denominator mid-run.
#[derive(Debug, Clone, Default)]
pub struct ProgressAggregator {
    current: ProgressCounters,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> ProgressCounters {
        self.current
    }

    /// Recomputes progress from the current contributions of every batch in
    /// the run.
    ///
    /// # Returns
    /// The updated counters
    pub fn observe<I>(&mut self, contributions: I) -> ProgressCounters
    where
        I: IntoIterator<Item = BatchContribution>,
    {
        let mut completed = 0;
        let mut total = 0;
        for contribution in contributions {
            match contribution {
                BatchContribution::Pending { symbols } => total += symbols,
                BatchContribution::Reported {
                    completed: done,
                    total: of,
                } => {
                    completed += done;
                    total += of;
                }
                BatchContribution::Dropped => {}
            }
        }

        self.current = ProgressCounters {
            completed: completed.max(self.current.completed),
            total: total.max(self.current.total),
        };
        self.current
    }
}
