use axum::http::StatusCode;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Bare `OPTIONS` without CORS request headers; the CORS layer answers real preflights.
pub async fn preflight() -> StatusCode {
    StatusCode::OK
}
