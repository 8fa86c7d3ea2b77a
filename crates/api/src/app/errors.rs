use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use aeon_core::ErrorCode;
use aeon_infra::domain_event_store::DomainEventStoreError;
use aeon_infra::priority_queue::QueueError;
use aeon_infra::replay::ReplayError;

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::TokenMismatch => StatusCode::FORBIDDEN,
        ErrorCode::RequestMalformed
        | ErrorCode::RevisionGap
        | ErrorCode::AggregateIdentifierMalformed => StatusCode::BAD_REQUEST,
        ErrorCode::ItemNotFound | ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::ItemNotLocked
        | ErrorCode::ItemAlreadyQueued
        | ErrorCode::RevisionAlreadyExists => StatusCode::CONFLICT,
        ErrorCode::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn json_error(code: ErrorCode, message: impl Into<String>) -> axum::response::Response {
    (
        status_for(code),
        axum::Json(json!({
            "code": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn malformed(message: impl Into<String>) -> axum::response::Response {
    json_error(ErrorCode::RequestMalformed, message)
}

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    let code = err.code();
    if code == ErrorCode::UnknownError {
        error!(error = %err, "priority queue operation failed");
    }
    json_error(code, err.to_string())
}

pub fn store_error_to_response(err: DomainEventStoreError) -> axum::response::Response {
    let code = err.code();
    if code == ErrorCode::UnknownError {
        error!(error = %err, "domain event store operation failed");
    }
    json_error(code, err.to_string())
}

pub fn replay_error_to_response(err: ReplayError) -> axum::response::Response {
    match err {
        ReplayError::Validation(msg) => malformed(msg),
        ReplayError::Store(e) => store_error_to_response(e),
        ReplayError::Queue(e) => queue_error_to_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_failures_map_to_distinct_statuses() {
        assert_eq!(status_for(ErrorCode::TokenMismatch), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorCode::ItemNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorCode::ItemNotLocked), StatusCode::CONFLICT);
    }

    #[test]
    fn storage_failures_are_unknown_errors() {
        let response = store_error_to_response(DomainEventStoreError::Storage("disk".into()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = replay_error_to_response(ReplayError::Validation("from > to".into()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
