use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, Query};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crmflow_core::OrganizationScope;

use crate::app::dto::{self, BackfillBody, EnqueueBody, RequeueBody, StatsQuery};
use crate::app::errors::{domain_error_to_response, json_error, pipeline_error_to_response};
use crate::app::services::AppServices;

pub async fn tick(Extension(services): Extension<Arc<AppServices>>) -> Response {
    Json(services.scheduler.tick().await).into_response()
}

pub async fn backfill(Extension(services): Extension<Arc<AppServices>>, body: Bytes) -> Response {
    let body: BackfillBody = match dto::parse_body(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let request = match body.into_request() {
        Ok(r) => r,
        Err(e) => return domain_error_to_response(e),
    };

    match services.backfill.run(request).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => pipeline_error_to_response(e),
    }
}

pub async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let scope = match query.organization_id() {
        Ok(org) => OrganizationScope::from(org),
        Err(e) => return domain_error_to_response(e),
    };

    match services.stats.snapshot(scope).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => pipeline_error_to_response(e),
    }
}

pub async fn enqueue(Extension(services): Extension<Arc<AppServices>>, body: Bytes) -> Response {
    let body: EnqueueBody = match dto::parse_body(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let request = match body.into_request() {
        Ok(r) => r,
        Err(e) => return domain_error_to_response(e),
    };

    match services.enqueuer.enqueue_message(request).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => pipeline_error_to_response(e),
    }
}

pub async fn requeue_failed(Extension(services): Extension<Arc<AppServices>>, body: Bytes) -> Response {
    let body: RequeueBody = match dto::parse_body(&body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let request = match body.into_request() {
        Ok(r) => r,
        Err(e) => return domain_error_to_response(e),
    };

    match services.enqueuer.requeue_failed(request).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => pipeline_error_to_response(e),
    }
}

/// Unknown paths: `POST` runs a tick, a bare `OPTIONS` gets an empty 200.
pub async fn fallback(method: Method, Extension(services): Extension<Arc<AppServices>>) -> Response {
    match method {
        Method::POST => tick(Extension(services)).await,
        Method::OPTIONS => StatusCode::OK.into_response(),
        _ => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
    }
}
