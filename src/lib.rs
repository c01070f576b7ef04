//! Batched indicator extraction for a universe of stock symbols.
//!
//! Symbols are split into batches and submitted to a remote extraction
//! service as asynchronous jobs, at most a configured number at a time.
//! Active jobs are polled on a fixed interval; their partial results merge
//! into a shared store keyed by symbol and indicator, and raw HTML results
//! are handed to a normalization service as soon as they appear.

pub mod config;
pub mod data;
pub mod error;
pub mod extraction;

#[cfg(test)]
mod testing;

pub use config::ExtractionConfig;
pub use error::{ExtractionError, Result};
pub use extraction::{Orchestrator, ProgressCounters, RunSnapshot, RunStatus};
