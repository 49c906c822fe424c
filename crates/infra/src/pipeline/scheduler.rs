//! Tick driver.
//!
//! A tick dispatches every worker group once, in `WorkerGroup::ALL` order. A failing
//! group is recorded as `{"error": "<message>"}` under its key and never stops the
//! remaining groups. The scheduler keeps no state between ticks; claim exclusivity
//! lives in the job store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crmflow_core::WorkerGroup;

use super::dispatcher::{DispatchError, WorkerDispatcher, WorkerRequest};
use crate::config::DispatchMode;

pub const TICK_COMPLETE: &str = "tick_complete";

/// Aggregated tick result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub status: String,
    pub results: serde_json::Map<String, serde_json::Value>,
}

impl TickReport {
    pub fn result(&self, group: WorkerGroup) -> Option<&serde_json::Value> {
        self.results.get(group.as_str())
    }

    pub fn failed_groups(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, v)| v.get("error").is_some())
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

#[derive(Clone)]
pub struct Scheduler {
    dispatcher: Arc<dyn WorkerDispatcher>,
    batch_size: u32,
    mode: DispatchMode,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<dyn WorkerDispatcher>, batch_size: u32, mode: DispatchMode) -> Self {
        Self {
            dispatcher,
            batch_size,
            mode,
        }
    }

    #[instrument(skip(self), fields(batch_size = self.batch_size, mode = ?self.mode))]
    pub async fn tick(&self) -> TickReport {
        let outcomes = match self.mode {
            DispatchMode::Sequential => self.dispatch_sequential().await,
            DispatchMode::Concurrent => self.dispatch_concurrent().await,
        };

        let mut results = serde_json::Map::new();
        for (group, outcome) in outcomes {
            let value = match outcome {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(worker_group = %group, error = %e, "worker group dispatch failed");
                    serde_json::json!({ "error": e.to_string() })
                }
            };
            results.insert(group.as_str().to_string(), value);
        }

        TickReport {
            status: TICK_COMPLETE.to_string(),
            results,
        }
    }

    fn request(&self, worker_group: WorkerGroup) -> WorkerRequest {
        WorkerRequest {
            worker_group,
            batch_size: self.batch_size,
        }
    }

    async fn dispatch_sequential(
        &self,
    ) -> Vec<(WorkerGroup, Result<serde_json::Value, DispatchError>)> {
        let mut outcomes = Vec::with_capacity(WorkerGroup::ALL.len());
        for group in WorkerGroup::ALL {
            let outcome = self.dispatcher.dispatch(self.request(group)).await;
            outcomes.push((group, outcome));
        }
        outcomes
    }

    /// One task per group; handles are awaited in tick order so a panicking task is
    /// still attributed to its group.
    async fn dispatch_concurrent(
        &self,
    ) -> Vec<(WorkerGroup, Result<serde_json::Value, DispatchError>)> {
        let handles: Vec<_> = WorkerGroup::ALL
            .iter()
            .map(|group| {
                let dispatcher = self.dispatcher.clone();
                let request = self.request(*group);
                (*group, tokio::spawn(async move { dispatcher.dispatch(request).await }))
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (group, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(DispatchError::Worker(format!("dispatch task aborted: {e}"))),
            };
            outcomes.push((group, outcome));
        }
        outcomes
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("batch_size", &self.batch_size)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
