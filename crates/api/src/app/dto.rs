//! Request bodies as they arrive on the wire.
//!
//! Identifiers stay strings here and are parsed into domain ids separately, so a malformed
//! id is a 400 with a precise message instead of a generic body rejection.

use axum::body::Bytes;
use axum::http::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crmflow_core::{DomainError, MessageId, OrganizationId, WorkerGroup};
use crmflow_infra::pipeline::{BackfillRequest, EnqueueRequest, RequeueRequest};

use super::errors::json_error;

#[derive(Debug, Default, Deserialize)]
pub struct BackfillBody {
    pub organization_id: Option<String>,
    pub limit: Option<i64>,
    pub priority: Option<i32>,
}

impl BackfillBody {
    pub fn into_request(self) -> Result<BackfillRequest, DomainError> {
        Ok(BackfillRequest {
            organization_id: parse_optional(self.organization_id)?,
            limit: self.limit,
            priority: self.priority,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EnqueueBody {
    pub organization_id: Option<String>,
    pub message_id: Option<String>,
    pub priority: Option<i32>,
}

impl EnqueueBody {
    pub fn into_request(self) -> Result<EnqueueRequest, DomainError> {
        Ok(EnqueueRequest {
            organization_id: parse_optional(self.organization_id)?,
            message_id: parse_optional::<MessageId>(self.message_id)?,
            priority: self.priority,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RequeueBody {
    pub organization_id: Option<String>,
    pub limit: Option<i64>,
}

impl RequeueBody {
    pub fn into_request(self) -> Result<RequeueRequest, DomainError> {
        Ok(RequeueRequest {
            organization_id: parse_optional(self.organization_id)?,
            limit: self.limit,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkerBody {
    pub worker_group: Option<String>,
    pub batch_size: Option<u32>,
}

impl WorkerBody {
    pub fn worker_group(&self) -> Result<WorkerGroup, DomainError> {
        let raw = self
            .worker_group
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(DomainError::MissingParameter("worker_group"))?;
        raw.parse()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub organization_id: Option<String>,
}

impl StatsQuery {
    pub fn organization_id(self) -> Result<Option<OrganizationId>, DomainError> {
        parse_optional(self.organization_id)
    }
}

/// Parse a JSON body; an empty body is the default value.
pub fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, axum::response::Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        json_error(StatusCode::BAD_REQUEST, "invalid_json", format!("invalid JSON body: {e}"))
    })
}

/// Blank strings count as absent.
fn parse_optional<T>(raw: Option<String>) -> Result<Option<T>, DomainError>
where
    T: std::str::FromStr<Err = DomainError>,
{
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some),
    }
}
