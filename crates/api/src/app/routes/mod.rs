use axum::routing::{get, post};
use axum::Router;

use crate::middleware::{ServiceKeyState, service_key_middleware};

pub mod scheduler;
pub mod system;
pub mod worker;

pub fn router(service_key: ServiceKeyState) -> Router {
    let worker_routes = Router::new()
        .route("/pipeline-worker", post(worker::run).options(system::preflight))
        .route_layer(axum::middleware::from_fn_with_state(
            service_key,
            service_key_middleware,
        ));

    Router::new()
        .route("/health", get(system::health).options(system::preflight))
        .route("/tick", post(scheduler::tick).options(system::preflight))
        .route("/backfill", post(scheduler::backfill).options(system::preflight))
        .route("/stats", get(scheduler::stats).options(system::preflight))
        .route("/enqueue", post(scheduler::enqueue).options(system::preflight))
        .route("/requeue-failed", post(scheduler::requeue_failed).options(system::preflight))
        .merge(worker_routes)
}
