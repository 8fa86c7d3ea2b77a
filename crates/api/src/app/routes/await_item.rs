//! Priority queue protocol: await, renew, acknowledge and defer leased items.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;

use aeon_core::LockMetadata;

use crate::app::dto::{AwaitedItem, DeferRequest};
use crate::app::services::AppServices;
use crate::app::{errors, streaming};

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/", get(await_item))
        .route("/renew-lock", post(renew_lock))
        .route("/acknowledge", post(acknowledge))
        .route("/defer", post(defer))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /await-domain-event/v2
///
/// Heartbeats until an item can be leased, then one `{item, metadata}` line.
/// A lease taken for a client that has already gone away is released.
pub async fn await_item(Extension(services): Extension<Arc<AppServices>>) -> Response {
    let frames = services
        .dispatcher
        .stream_next_item(services.heartbeat_interval)
        .map(|result| result.map(|frame| frame.map(AwaitedItem::from)));

    streaming::ndjson(frames)
}

/// POST /await-domain-event/v2/renew-lock
pub async fn renew_lock(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<LockMetadata>, JsonRejection>,
) -> Response {
    let Json(lock) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::malformed(rejection.body_text()),
    };

    match services
        .dispatcher
        .renew_lock(&lock.discriminator, lock.token)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /await-domain-event/v2/acknowledge
pub async fn acknowledge(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<LockMetadata>, JsonRejection>,
) -> Response {
    let Json(lock) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::malformed(rejection.body_text()),
    };

    match services
        .dispatcher
        .acknowledge(&lock.discriminator, lock.token)
        .await
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// POST /await-domain-event/v2/defer
pub async fn defer(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<DeferRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::malformed(rejection.body_text()),
    };

    match services
        .dispatcher
        .defer(&request.lock.discriminator, request.lock.token, request.priority)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
