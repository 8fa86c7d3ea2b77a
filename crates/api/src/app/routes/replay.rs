//! Replay protocol: re-enqueue stored revision windows for their flows.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};

use crate::app::dto::PerformReplayRequest;
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/", post(perform_replay))
}

/// POST /perform-replay/v2
///
/// Responds once every requested event is enqueued (or already was).
pub async fn perform_replay(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<PerformReplayRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::malformed(rejection.body_text()),
    };

    match services.replay.perform_replay(&request.aggregates).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::replay_error_to_response(e),
    }
}
