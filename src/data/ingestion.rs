use super::models::{ResultItem, Symbol};
use crate::error::{ExtractionError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

/// Handle to a remote extraction job.
///
/// # Fields
/// * `id`: Job identifier assigned by the extraction service
/// * `declared_total`: Number of items the service declared for the job
/// * `submitted_at`: When the job was accepted, stamped locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    #[serde(rename = "jobId")]
    pub id: String,
    pub declared_total: usize,
    #[serde(skip, default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

impl JobHandle {
    pub fn new(id: impl Into<String>, declared_total: usize) -> Self {
        Self {
            id: id.into(),
            declared_total,
            submitted_at: Utc::now(),
        }
    }
}

/// Remote job status as reported by a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Resolved,
}

/// One poll of a remote extraction job.
///
/// `results` is incremental: the service may redeliver items it already
/// returned on earlier polls, in any content kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub status: JobStatus,
    #[serde(default)]
    pub results: HashMap<Symbol, Vec<ResultItem>>,
    pub completed: usize,
    pub total: usize,
}

impl PollResponse {
    /// Whether the job has nothing left to report. A job that has not
    /// counted its work yet (`0/0`) is still running.
    pub fn is_terminal(&self) -> bool {
        self.status == JobStatus::Resolved || (self.total > 0 && self.completed >= self.total)
    }
}

/// Client for the rate-limited remote extraction service.
///
/// Implementations are shared across spawned tasks, so they must be
/// `Send + Sync` and cheap to call concurrently.
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Creates one remote job for `batch`.
    async fn submit(&self, batch: &[Symbol], invalidate_cache: bool) -> Result<JobHandle>;

    /// Fetches the current state of a job.
    async fn poll(&self, job_id: &str) -> Result<PollResponse>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest<'a> {
    symbols: &'a [Symbol],
    invalidate_cache: bool,
}

/// HTTP client for the extraction service.
///
/// Submits batches as `POST {base}/jobs` and polls them with
/// `GET {base}/jobs/{id}`, authenticating with a bearer token.
pub struct HttpJobClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpJobClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Creates a client from `EXTRACTION_API_URL` and `EXTRACTION_API_KEY`.
    ///
    /// # Errors
    /// Returns `ExtractionError::InvalidConfig` if either variable is not set
    pub fn from_env() -> Result<Self> {
        let base_url = env::var("EXTRACTION_API_URL").map_err(|_| {
            ExtractionError::InvalidConfig("EXTRACTION_API_URL must be set".to_string())
        })?;
        let api_key = env::var("EXTRACTION_API_KEY").map_err(|_| {
            ExtractionError::InvalidConfig("EXTRACTION_API_KEY must be set".to_string())
        })?;
        Ok(Self::new(base_url, api_key))
    }

    async fn read_json(response: reqwest::Response) -> Result<serde_json::Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = response.json::<serde_json::Value>().await?;

        // The service reports some failures inside a 200 body
        if let Some(message) = body.get("error").and_then(|e| e.as_str()) {
            return Err(ExtractionError::Api {
                status: status.as_u16(),
                message: message.to_string(),
            });
        }

        Ok(body)
    }
}

#[async_trait]
impl JobClient for HttpJobClient {
    /// Submits a batch of symbols as one extraction job.
    ///
    /// # Arguments
    /// * `batch`: Symbols to extract every indicator for
    /// * `invalidate_cache`: Ask the service to bypass its own result cache
    ///
    /// # Errors
    /// Returns `ExtractionError::Submission` wrapping the transport, status or
    /// parse failure
    async fn submit(&self, batch: &[Symbol], invalidate_cache: bool) -> Result<JobHandle> {
        let url = format!("{}/jobs", self.base_url);
        let request = SubmitRequest {
            symbols: batch,
            invalidate_cache,
        };

        let outcome = async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await?;
            let body = Self::read_json(response).await?;
            let handle: JobHandle = serde_json::from_value(body)?;
            Ok::<_, ExtractionError>(handle)
        }
        .await;

        outcome.map_err(|e| ExtractionError::Submission(e.to_string()))
    }

    /// Polls a job for incremental results.
    ///
    /// # Errors
    /// Returns `ExtractionError::Poll` wrapping the transport, status or
    /// parse failure
    async fn poll(&self, job_id: &str) -> Result<PollResponse> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);

        let outcome = async {
            let response = self
                .client
                .get(&url)
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            let body = Self::read_json(response).await?;
            let poll: PollResponse = serde_json::from_value(body)?;
            Ok::<_, ExtractionError>(poll)
        }
        .await;

        outcome.map_err(|e| ExtractionError::Poll {
            job_id: job_id.to_string(),
            message: e.to_string(),
        })
    }
}
