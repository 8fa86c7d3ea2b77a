//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store, queue, dispatcher and background-loop wiring
//! - `routes/`: HTTP routes + handlers (one file per protocol)
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: `{ code, message }` error responses
//! - `streaming.rs`: ndjson rendering of heartbeat-framed streams

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;
pub mod streaming;

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    routes::router().layer(ServiceBuilder::new().layer(Extension(services)))
}
