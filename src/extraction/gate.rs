//! Admission control for remote extraction jobs.
//!
//! The extraction service is slow and rate limited, so the number of jobs
//! being created plus the number of jobs being polled is bounded no matter
//! how many symbols a caller asks for.

use tracing::warn;

/// Counts batches currently submitting and currently polling, and admits new
/// submissions only while their sum is below `limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyGate {
    limit: usize,
    in_flight_submitting: usize,
    active_polling: usize,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_flight_submitting: 0,
            active_polling: 0,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight_submitting(&self) -> usize {
        self.in_flight_submitting
    }

    pub fn active_polling(&self) -> usize {
        self.active_polling
    }

    pub fn load(&self) -> usize {
        self.in_flight_submitting + self.active_polling
    }

    /// `max(0, limit - submitting - polling)`
    pub fn available_slots(&self) -> usize {
        self.limit.saturating_sub(self.load())
    }

    /// Takes a slot for a batch about to be submitted.
    ///
    /// Returns `false` and changes nothing when no slot is free.
    pub fn begin_submission(&mut self) -> bool {
        if self.available_slots() == 0 {
            return false;
        }
        self.in_flight_submitting += 1;
        true
    }

    /// A submission was accepted: its slot moves from submitting to polling.
    pub fn submission_succeeded(&mut self) {
        if self.in_flight_submitting == 0 {
            warn!("Submission accepted with no submission in flight");
        } else {
            self.in_flight_submitting -= 1;
        }
        self.active_polling += 1;
    }

    /// A submission failed: its slot is released.
    pub fn submission_failed(&mut self) {
        if self.in_flight_submitting == 0 {
            warn!("Submission failure reported with no submission in flight");
            return;
        }
        self.in_flight_submitting -= 1;
    }

    /// A polling batch reached a terminal state: its slot is released.
    pub fn batch_resolved(&mut self) {
        if self.active_polling == 0 {
            warn!("Batch resolved with no batch polling");
            return;
        }
        self.active_polling -= 1;
    }
}
