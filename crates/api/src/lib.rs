//! HTTP API: scheduler routes, worker endpoint and request/response mapping.

pub mod app;
pub mod middleware;
