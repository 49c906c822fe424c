use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::Extension;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::app::dto::{self, WorkerBody};
use crate::app::errors::{domain_error_to_response, pipeline_error_to_response};
use crate::app::services::AppServices;

/// `POST /pipeline-worker {worker_group, batch_size?}`
pub async fn run(Extension(services): Extension<Arc<AppServices>>, body: Bytes) -> Response {
    let body: WorkerBody = match dto::parse_body(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let group = match body.worker_group() {
        Ok(g) => g,
        Err(e) => return domain_error_to_response(e),
    };
    let batch_size = body.batch_size.unwrap_or(services.default_batch_size);

    match services.worker.run_batch(group, batch_size).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => pipeline_error_to_response(e),
    }
}
