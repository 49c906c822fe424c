//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store selection, worker and dispatcher wiring
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request bodies and id parsing
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::http::{HeaderName, Method, header};
use axum::{Extension, Router};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crmflow_infra::config::PipelineConfig;

use crate::middleware::ServiceKeyState;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Every route is also served under this prefix.
pub const ROUTE_PREFIX: &str = "/pipeline-scheduler";

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub async fn build_app(config: PipelineConfig) -> Result<Router, services::ServicesError> {
    let services = Arc::new(services::build_services(&config).await?);
    Ok(build_router(services, ServiceKeyState::new(config.service_key)))
}

pub fn build_router(services: Arc<services::AppServices>, service_key: ServiceKeyState) -> Router {
    Router::new()
        .merge(routes::router(service_key.clone()))
        .nest(ROUTE_PREFIX, routes::router(service_key))
        .fallback(routes::scheduler::fallback)
        .layer(Extension(services))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(build_cors_layer()),
        )
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
            header::CONTENT_TYPE,
        ])
}
