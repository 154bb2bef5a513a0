//! Producer client for the coordinator's RPC front door
//!
//! Wraps batch submission, polling, waiting and cancellation. Transient
//! failures (network errors and 5xx replies) are retried with backoff;
//! everything else is returned as is.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::models::{BatchId, BatchReport, BatchStatus, CancelOutcome, JobSpec};
use crate::utils::retry::{with_retry_if, RetryConfig};

use super::api::{ErrorResponse, HealthResponse, SubmitRequest, SubmitResponse};

// ============================================================================
// Client Configuration
// ============================================================================

/// Configuration for the producer client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator RPC base URL
    pub coordinator_url: String,

    /// Request timeout; waiting submissions are not limited by it
    pub timeout: Duration,

    /// Retry policy for transient failures
    pub retry: RetryConfig,

    /// Delay between status polls in [`RpcClient::wait`]
    pub poll_interval: Duration,
}

impl ClientConfig {
    /// Create a new client config
    pub fn new(coordinator_url: impl Into<String>) -> Self {
        Self {
            coordinator_url: coordinator_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(10),
            retry: RetryConfig::with_delays(3, 500, 5_000),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set retry count
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry.max_retries = count;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client used by producers to talk to the coordinator
pub struct RpcClient {
    config: ClientConfig,
    http_client: Client,
}

impl RpcClient {
    /// Create a new producer client
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http_client = Client::builder()
            .build()
            .map_err(|e| ClientError::Init(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Submit a batch without waiting for it
    pub async fn submit(&self, jobs: Vec<JobSpec>) -> Result<BatchId, ClientError> {
        let request = SubmitRequest { jobs, wait: false };
        let response: SubmitResponse = self
            .send(Method::POST, "/api/batches", Some(&request), Some(self.config.timeout))
            .await?;
        Ok(response.batch_id)
    }

    /// Submit a batch and hold the request open until its report is ready
    pub async fn submit_and_wait(&self, jobs: Vec<JobSpec>) -> Result<BatchReport, ClientError> {
        let request = SubmitRequest { jobs, wait: true };
        // A retried waiting submission would queue the batch twice
        self.request(Method::POST, "/api/batches", Some(&request), None)
            .await
    }

    /// Poll a batch's status
    pub async fn fetch(&self, batch_id: BatchId) -> Result<BatchStatus, ClientError> {
        let path = format!("/api/batches/{batch_id}");
        self.send::<(), _>(Method::GET, &path, None, Some(self.config.timeout))
            .await
    }

    /// Cancel a batch
    pub async fn cancel(&self, batch_id: BatchId) -> Result<CancelOutcome, ClientError> {
        let path = format!("/api/batches/{batch_id}");
        self.send::<(), _>(Method::DELETE, &path, None, Some(self.config.timeout))
            .await
    }

    /// Poll until the batch is finished or cancelled
    pub async fn wait(&self, batch_id: BatchId) -> Result<BatchReport, ClientError> {
        loop {
            match self.fetch(batch_id).await? {
                BatchStatus::Finished { report } => return Ok(report),
                BatchStatus::Cancelled => return Err(ClientError::Cancelled(batch_id)),
                BatchStatus::Pending { remaining } => {
                    debug!(batch_id = %batch_id, remaining, "Batch still pending");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Check coordinator health
    pub async fn health_check(&self) -> Result<HealthResponse, ClientError> {
        self.send::<(), _>(Method::GET, "/api/health", None, Some(self.config.timeout))
            .await
    }

    // Internal: request with retry on transient failures
    async fn send<B, R>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        timeout: Option<Duration>,
    ) -> Result<R, ClientError>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        with_retry_if(
            &self.config.retry,
            || self.request(method.clone(), path, body, timeout),
            ClientError::is_transient,
        )
        .await
    }

    // Internal: single request
    async fn request<B, R>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        timeout: Option<Duration>,
    ) -> Result<R, ClientError>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.config.coordinator_url, path);
        let mut builder = self.http_client.request(method, &url);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        let status = response.status();

        if status.is_success() {
            return response
                .json::<R>()
                .await
                .map_err(|e| ClientError::Parse(e.to_string()));
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| e.error)
            .unwrap_or(text);

        Err(match status {
            StatusCode::BAD_REQUEST => ClientError::Rejected(message),
            StatusCode::NOT_FOUND => ClientError::NotFound(message),
            StatusCode::CONFLICT => ClientError::Conflict(message),
            _ => ClientError::Http {
                status: status.as_u16(),
                message,
            },
        })
    }
}

// ============================================================================
// Client Errors
// ============================================================================

/// Client errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("Initialization error: {0}")]
    Init(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    /// The coordinator refused the batch (validation error)
    #[error("Batch rejected: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Batch {0} was cancelled")]
    Cancelled(BatchId),
}

impl ClientError {
    /// Network failures and server-side errors may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Batch input file format for the CLI: a bare array of specs or
/// `{"jobs": [...]}`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BatchFile {
    Jobs(Vec<JobSpec>),
    Wrapped { jobs: Vec<JobSpec> },
}

impl BatchFile {
    pub fn into_jobs(self) -> Vec<JobSpec> {
        match self {
            Self::Jobs(jobs) | Self::Wrapped { jobs } => jobs,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
