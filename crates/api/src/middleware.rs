use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::app::errors::json_error;

/// Credential the worker endpoint requires, when one is configured.
#[derive(Clone, Default)]
pub struct ServiceKeyState {
    pub key: Option<Arc<str>>,
}

impl ServiceKeyState {
    pub fn new(key: Option<String>) -> Self {
        Self {
            key: key.map(Arc::from),
        }
    }
}

/// Rejects requests whose bearer token differs from the service key.
///
/// Without a configured key every request passes, as does a bare `OPTIONS`.
pub async fn service_key_middleware(
    State(state): State<ServiceKeyState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(expected) = state.key.as_deref() {
        if req.method() == Method::OPTIONS {
            return next.run(req).await;
        }
        match extract_bearer(req.headers()) {
            Ok(token) if key_matches(token, expected) => {}
            _ => {
                tracing::warn!(path = %req.uri().path(), "rejected worker call without valid service key");
                return json_error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid service key");
            }
        }
    }

    next.run(req).await
}

/// Constant-time key comparison.
fn key_matches(token: &str, expected: &str) -> bool {
    bool::from(token.as_bytes().ct_eq(expected.as_bytes()))
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, StatusCode> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(token)
}
