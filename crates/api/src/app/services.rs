//! Service wiring: stores, worker, dispatcher and the request-level coordinators.
//!
//! `DATABASE_URL` selects the Postgres stores; without it everything runs in memory.
//! `PIPELINE_WORKER_URL` selects the HTTP dispatcher; without it ticks call the
//! in-process worker.

use std::sync::Arc;

use crmflow_ai::StageRegistry;
use crmflow_infra::config::PipelineConfig;
use crmflow_infra::db;
use crmflow_infra::jobs::{InMemoryJobStore, JobStore, PostgresJobStore};
use crmflow_infra::messages::{
    DerivedRecordStore, InMemoryDerivedStore, InMemoryMessageStore, MessageSource,
    PostgresDerivedStore, PostgresMessageStore,
};
use crmflow_infra::pipeline::{
    BackfillCoordinator, DispatchError, Enqueuer, HttpWorkerDispatcher, LocalWorkerDispatcher,
    PipelineWorker, Scheduler, StatsReporter, WorkerDispatcher,
};

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("database connection failed: {0}")]
    Database(String),

    #[error(transparent)]
    Dispatcher(#[from] DispatchError),
}

/// Storage backends shared by every service.
#[derive(Clone)]
pub struct Backends {
    pub jobs: Arc<dyn JobStore>,
    pub messages: Arc<dyn MessageSource>,
    pub derived: Arc<dyn DerivedRecordStore>,
}

impl Backends {
    pub async fn postgres(database_url: &str) -> Result<Self, ServicesError> {
        let pool = db::create_pool(database_url)
            .await
            .map_err(|e| ServicesError::Database(e.to_string()))?;

        Ok(Self {
            jobs: Arc::new(PostgresJobStore::new(pool.clone())),
            messages: Arc::new(PostgresMessageStore::new(pool.clone())),
            derived: Arc::new(PostgresDerivedStore::new(pool)),
        })
    }
}

/// In-memory backends with their concrete types kept, so callers can seed them.
#[derive(Clone, Default)]
pub struct InMemoryBackends {
    pub jobs: Arc<InMemoryJobStore>,
    pub messages: Arc<InMemoryMessageStore>,
    pub derived: Arc<InMemoryDerivedStore>,
}

impl InMemoryBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backends(&self) -> Backends {
        Backends {
            jobs: self.jobs.clone(),
            messages: self.messages.clone(),
            derived: self.derived.clone(),
        }
    }
}

pub struct AppServices {
    pub scheduler: Scheduler,
    pub backfill: BackfillCoordinator,
    pub enqueuer: Enqueuer,
    pub stats: StatsReporter,
    pub worker: Arc<PipelineWorker>,
    /// Batch size used by the worker endpoint when the body omits one.
    pub default_batch_size: u32,
}

pub async fn build_services(config: &PipelineConfig) -> Result<AppServices, ServicesError> {
    let backends = match config.database_url.as_deref() {
        Some(url) => Backends::postgres(url).await?,
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            InMemoryBackends::new().backends()
        }
    };

    services_with_backends(config, backends)
}

pub fn services_with_backends(
    config: &PipelineConfig,
    backends: Backends,
) -> Result<AppServices, ServicesError> {
    let worker = Arc::new(
        PipelineWorker::new(
            backends.jobs.clone(),
            backends.messages.clone(),
            backends.derived.clone(),
            Arc::new(StageRegistry::default()),
        )
        .with_retry_policy(config.retry_policy())
        .with_defer_delay(config.defer_delay)
        .with_claim_lease(config.claim_lease),
    );

    let dispatcher: Arc<dyn WorkerDispatcher> = match config.worker_endpoint() {
        Some(endpoint) => {
            tracing::info!(%endpoint, "dispatching worker groups over HTTP");
            Arc::new(HttpWorkerDispatcher::new(
                endpoint,
                config.service_key.clone(),
                config.worker_timeout,
            )?)
        }
        None => Arc::new(LocalWorkerDispatcher::new(worker.clone())),
    };

    Ok(AppServices {
        scheduler: Scheduler::new(dispatcher, config.batch_size, config.dispatch_mode),
        backfill: BackfillCoordinator::new(
            backends.jobs.clone(),
            backends.messages.clone(),
            backends.derived.clone(),
        ),
        enqueuer: Enqueuer::new(backends.jobs.clone(), backends.derived.clone()),
        stats: StatsReporter::new(backends.jobs),
        worker,
        default_batch_size: config.batch_size,
    })
}
