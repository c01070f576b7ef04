use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExtractionError>;

/// Errors raised by the extraction core and its remote collaborators.
///
/// Only `InvalidConfig` and `Closed` ever reach a caller of the orchestrator.
/// Everything else is turned into a batch state or a store entry by the
/// scheduler and the enrichment dispatcher.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Batch submission failed: {0}")]
    Submission(String),

    #[error("Poll failed for job {job_id}: {message}")]
    Poll { job_id: String, message: String },

    #[error("Normalization failed for {symbol}/{indicator}: {message}")]
    Normalization {
        symbol: String,
        indicator: String,
        message: String,
    },

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Orchestrator is no longer running")]
    Closed,
}

impl From<reqwest::Error> for ExtractionError {
    fn from(err: reqwest::Error) -> Self {
        ExtractionError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ExtractionError {
    fn from(err: serde_json::Error) -> Self {
        ExtractionError::Parse(err.to_string())
    }
}
