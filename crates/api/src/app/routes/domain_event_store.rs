//! Domain event store protocol: writes, point lookups and replay streams.
//!
//! Every stream starts with a heartbeat and repeats it while the store is
//! idle, so proxies keep the connection open during long scans.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Extension, Path, Query,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use aeon_core::{AggregateId, ErrorCode};
use aeon_infra::domain_event_store::{DomainEventStoreError, RevisionRange};
use aeon_infra::streaming::with_heartbeats;

use crate::app::dto::{
    AggregateIdentifierQuery, CausationIdQuery, CorrelationIdQuery,
    HasDomainEventsWithCausationIdResponse, ReplayQuery, RevisionQuery, StoreSnapshotRequest,
    WriteDomainEventsRequest,
};
use crate::app::services::AppServices;
use crate::app::{errors, streaming};

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/write", post(write))
        .route("/replay", get(replay))
        .route("/replay/:aggregate_id", get(replay_aggregate))
        .route("/last-domain-event", get(last_domain_event))
        .route("/domain-events-by-causation-id", get(by_causation_id))
        .route("/domain-events-by-correlation-id", get(by_correlation_id))
        .route(
            "/has-domain-events-with-causation-id",
            get(has_domain_events_with_causation_id),
        )
        .route("/snapshot", get(get_snapshot).post(store_snapshot))
        .route("/aggregate-identifiers", get(aggregate_identifiers))
}

// ─────────────────────────────────────────────────────────────────────────────
// Writes
// ─────────────────────────────────────────────────────────────────────────────

/// POST /domain-event-store/v2/write
///
/// Appends atomically, then enqueues for owning flows.
pub async fn write(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<WriteDomainEventsRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::malformed(rejection.body_text()),
    };

    match services
        .domain_event_store
        .store_domain_events(request.domain_events)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /domain-event-store/v2/snapshot
pub async fn store_snapshot(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<StoreSnapshotRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::malformed(rejection.body_text()),
    };

    match services
        .domain_event_store
        .store_snapshot(request.snapshot)
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streams
// ─────────────────────────────────────────────────────────────────────────────

/// GET /domain-event-store/v2/replay?fromTimestamp=N
pub async fn replay(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<ReplayQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return errors::malformed(rejection.body_text()),
    };
    if query.from_timestamp.is_some_and(|ts| ts < 0) {
        return errors::malformed("fromTimestamp must be at least 0");
    }

    match services
        .domain_event_store
        .get_replay(query.from_timestamp)
        .await
    {
        Ok(events) => streaming::ndjson(with_heartbeats(events, services.heartbeat_interval)),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /domain-event-store/v2/replay/:aggregateId?fromRevision=N&toRevision=M
pub async fn replay_aggregate(
    Extension(services): Extension<Arc<AppServices>>,
    Path(aggregate_id): Path<String>,
    query: Result<Query<RevisionQuery>, QueryRejection>,
) -> Response {
    let aggregate_id = match Uuid::parse_str(&aggregate_id) {
        Ok(uuid) => AggregateId::from_uuid(uuid),
        Err(e) => return errors::malformed(format!("invalid aggregate id: {e}")),
    };
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return errors::malformed(rejection.body_text()),
    };
    let range = match RevisionRange::new(query.from_revision, query.to_revision) {
        Ok(range) => range,
        Err(e) => return errors::store_error_to_response(e),
    };

    match services
        .domain_event_store
        .get_replay_for_aggregate(aggregate_id, range)
        .await
    {
        Ok(events) => streaming::ndjson(with_heartbeats(events, services.heartbeat_interval)),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /domain-event-store/v2/domain-events-by-causation-id?causation-id=ID
pub async fn by_causation_id(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<CausationIdQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return errors::malformed(rejection.body_text()),
    };

    match services
        .domain_event_store
        .get_domain_events_by_causation_id(query.causation_id)
        .await
    {
        Ok(events) => streaming::ndjson(with_heartbeats(events, services.heartbeat_interval)),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /domain-event-store/v2/domain-events-by-correlation-id?correlation-id=ID
pub async fn by_correlation_id(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<CorrelationIdQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return errors::malformed(rejection.body_text()),
    };

    match services
        .domain_event_store
        .get_domain_events_by_correlation_id(query.correlation_id)
        .await
    {
        Ok(events) => streaming::ndjson(with_heartbeats(events, services.heartbeat_interval)),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /domain-event-store/v2/aggregate-identifiers
pub async fn aggregate_identifiers(Extension(services): Extension<Arc<AppServices>>) -> Response {
    match services.domain_event_store.get_aggregate_identifiers().await {
        Ok(identifiers) => {
            streaming::ndjson(with_heartbeats(identifiers, services.heartbeat_interval))
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Point lookups
// ─────────────────────────────────────────────────────────────────────────────

/// GET /domain-event-store/v2/last-domain-event?aggregateIdentifier=<json>
pub async fn last_domain_event(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<AggregateIdentifierQuery>, QueryRejection>,
) -> Response {
    let identifier = match query {
        Ok(Query(query)) => match query.parse() {
            Ok(identifier) => identifier,
            Err(response) => return response,
        },
        Err(rejection) => {
            return errors::json_error(
                ErrorCode::AggregateIdentifierMalformed,
                rejection.body_text(),
            );
        }
    };

    match services
        .domain_event_store
        .get_last_domain_event(&identifier)
        .await
    {
        Ok(event) => Json(event).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /domain-event-store/v2/has-domain-events-with-causation-id?causation-id=ID
pub async fn has_domain_events_with_causation_id(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<CausationIdQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return errors::malformed(rejection.body_text()),
    };

    match services
        .domain_event_store
        .has_domain_events_with_causation_id(query.causation_id)
        .await
    {
        Ok(found) => Json(HasDomainEventsWithCausationIdResponse {
            has_domain_events_with_causation_id: found,
        })
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /domain-event-store/v2/snapshot?aggregateIdentifier=<json>
pub async fn get_snapshot(
    Extension(services): Extension<Arc<AppServices>>,
    query: Result<Query<AggregateIdentifierQuery>, QueryRejection>,
) -> Response {
    let identifier = match query {
        Ok(Query(query)) => match query.parse() {
            Ok(identifier) => identifier,
            Err(response) => return response,
        },
        Err(rejection) => {
            return errors::json_error(
                ErrorCode::AggregateIdentifierMalformed,
                rejection.body_text(),
            );
        }
    };

    match services.domain_event_store.get_snapshot(&identifier).await {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => errors::store_error_to_response(DomainEventStoreError::NotFound(format!(
            "no snapshot for aggregate {}",
            identifier.id
        ))),
        Err(e) => errors::store_error_to_response(e),
    }
}
