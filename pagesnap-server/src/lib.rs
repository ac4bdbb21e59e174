//! HTTP API and worker process wiring for pagesnap.

pub mod handlers;
pub mod infra;
pub mod routes;
