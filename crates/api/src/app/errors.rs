use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use crmflow_core::DomainError;
use crmflow_infra::pipeline::PipelineError;

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    match err {
        PipelineError::Domain(e) => domain_error_to_response(e),
        PipelineError::JobStore(e) => {
            tracing::error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        PipelineError::MessageStore(e) => {
            tracing::error!(error = %e, "message store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    let code = match &err {
        DomainError::MissingParameter(_) => "missing_parameter",
        DomainError::Validation(_) => "validation_error",
        DomainError::InvalidId(_) => "invalid_id",
        DomainError::UnknownVariant { .. } => "unknown_variant",
    };
    json_error(StatusCode::BAD_REQUEST, code, err.to_string())
}

/// `{"error": <message>, "code": <machine code>}`
pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": message.into(),
            "code": code,
        })),
    )
        .into_response()
}
