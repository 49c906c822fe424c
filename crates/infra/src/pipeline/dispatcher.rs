//! Worker group dispatch.
//!
//! The scheduler treats the worker's answer as opaque JSON. No retry happens here:
//! the next tick is the retry.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crmflow_core::WorkerGroup;

use super::worker::PipelineWorker;

/// Body sent to the worker endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub worker_group: WorkerGroup,
    pub batch_size: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("worker request failed: {0}")]
    Transport(String),

    #[error("worker responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("worker response is not JSON: {0}")]
    Decode(String),

    #[error("worker failed: {0}")]
    Worker(String),
}

/// Invokes the stage worker for one group.
#[async_trait::async_trait]
pub trait WorkerDispatcher: Send + Sync {
    async fn dispatch(&self, request: WorkerRequest) -> Result<serde_json::Value, DispatchError>;
}

/// POSTs to `<worker base URL>/pipeline-worker`.
#[derive(Debug, Clone)]
pub struct HttpWorkerDispatcher {
    endpoint: String,
    service_key: Option<String>,
    client: reqwest::Client,
}

impl HttpWorkerDispatcher {
    pub fn new(
        endpoint: impl Into<String>,
        service_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.into(),
            service_key,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl WorkerDispatcher for HttpWorkerDispatcher {
    async fn dispatch(&self, request: WorkerRequest) -> Result<serde_json::Value, DispatchError> {
        tracing::debug!(
            worker_group = %request.worker_group,
            batch_size = request.batch_size,
            url = %self.endpoint,
            "dispatching worker group"
        );

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.service_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Transport(format!("timed out calling {}", self.endpoint))
            } else {
                DispatchError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| DispatchError::Decode(e.to_string()))
    }
}

/// Runs the worker in-process (no worker URL configured).
#[derive(Debug, Clone)]
pub struct LocalWorkerDispatcher {
    worker: Arc<PipelineWorker>,
}

impl LocalWorkerDispatcher {
    pub fn new(worker: Arc<PipelineWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait::async_trait]
impl WorkerDispatcher for LocalWorkerDispatcher {
    async fn dispatch(&self, request: WorkerRequest) -> Result<serde_json::Value, DispatchError> {
        let report = self
            .worker
            .run_batch(request.worker_group, request.batch_size)
            .await
            .map_err(|e| DispatchError::Worker(e.to_string()))?;

        serde_json::to_value(report).map_err(|e| DispatchError::Decode(e.to_string()))
    }
}
