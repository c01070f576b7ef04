pub mod enrichment;
pub mod gate;
pub mod orchestrator;
pub mod progress;
pub mod scheduler;
pub mod splitter;
pub mod store;

pub use enrichment::EnrichmentDispatcher;
pub use gate::ConcurrencyGate;
pub use orchestrator::Orchestrator;
pub use progress::{BatchContribution, ProgressAggregator, ProgressCounters};
pub use scheduler::{BatchId, BatchState, RunId, RunSnapshot, RunStatus};
pub use splitter::{split, Batch};
pub use store::{EnrichmentCandidate, MergeOutcome, MergeStore};
