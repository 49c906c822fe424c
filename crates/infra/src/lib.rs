//! Infrastructure layer: configuration, Postgres / in-memory stores, worker transport
//! and the pipeline coordination services (scheduler, backfill, stats, worker).

pub mod config;
pub mod db;
pub mod jobs;
pub mod messages;
pub mod pipeline;
