//! Transport to the memory worker

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::capture::CaptureSubmission;
use crate::error::RemoteError;

/// The downstream memory-processing worker
#[async_trait]
pub trait MemoryWorker: Send + Sync {
    /// Hand one capture to the worker
    async fn submit_capture(&self, submission: &CaptureSubmission) -> Result<(), RemoteError>;

    /// Ask the worker for context relevant to `query`
    async fn query_context(&self, query: &str) -> Result<String, RemoteError>;

    /// Cheap liveness check
    async fn health_check(&self) -> Result<(), RemoteError>;
}

#[derive(Debug, Serialize)]
struct ContextRequest<'a> {
    query: &'a str,
}

#[derive(Debug, Deserialize)]
struct ContextReply {
    context: String,
}

/// HTTP implementation of [`MemoryWorker`]
pub struct HttpWorker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWorker {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::permanent(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Map a transport error onto the retry taxonomy
fn classify_transport(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::permanent(format!("malformed response: {}", err))
    } else if err.is_builder() {
        RemoteError::permanent(format!("bad request: {}", err))
    } else {
        // timeouts, refused connections, resets
        RemoteError::transient(err.to_string())
    }
}

/// Map a non-success status onto the retry taxonomy
fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        RemoteError::transient(detail)
    } else {
        RemoteError::permanent(detail)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, body.trim()))
}

#[async_trait]
impl MemoryWorker for HttpWorker {
    async fn submit_capture(&self, submission: &CaptureSubmission) -> Result<(), RemoteError> {
        let response = self
            .client
            .post(self.url("/captures"))
            .json(submission)
            .send()
            .await
            .map_err(classify_transport)?;

        check_status(response).await?;
        Ok(())
    }

    async fn query_context(&self, query: &str) -> Result<String, RemoteError> {
        let response = self
            .client
            .post(self.url("/context"))
            .json(&ContextRequest { query })
            .send()
            .await
            .map_err(classify_transport)?;

        let reply: ContextReply = check_status(response)
            .await?
            .json()
            .await
            .map_err(classify_transport)?;

        Ok(reply.context)
    }

    async fn health_check(&self) -> Result<(), RemoteError> {
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(classify_transport)?;

        check_status(response).await?;
        Ok(())
    }
}

/// Bounded-timeout wrapper around a [`MemoryWorker`].
///
/// Meant to be called only from inside `CircuitBreaker::execute`.
#[derive(Clone)]
pub struct RemoteClient {
    worker: Arc<dyn MemoryWorker>,
    timeout: Duration,
}

impl RemoteClient {
    pub fn new(worker: Arc<dyn MemoryWorker>, timeout: Duration) -> Self {
        Self { worker, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn submit_capture(&self, submission: &CaptureSubmission) -> Result<(), RemoteError> {
        self.bounded(self.worker.submit_capture(submission)).await
    }

    pub async fn query_context(&self, query: &str) -> Result<String, RemoteError> {
        self.bounded(self.worker.query_context(query)).await
    }

    pub async fn health_check(&self) -> Result<(), RemoteError> {
        self.bounded(self.worker.health_check()).await
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::transient(format!(
                "memory worker did not answer within {:?}",
                self.timeout
            ))),
        }
    }
}
