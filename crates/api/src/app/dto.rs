//! Request/response bodies of the three HTTP protocols.
//!
//! Shared by the route handlers and by `crate::client`.

use axum::response::Response;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aeon_core::{AggregateIdentifier, DomainEvent, ErrorCode, LockMetadata, Snapshot};
use aeon_infra::dispatcher::LeasedDomainEvent;
use aeon_infra::replay::ReplayWindow;

use crate::app::errors;

// -------------------------
// Priority queue protocol
// -------------------------

/// The single item line of an await-item stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwaitedItem {
    pub item: DomainEvent,
    pub metadata: LockMetadata,
}

impl From<LeasedDomainEvent> for AwaitedItem {
    fn from(leased: LeasedDomainEvent) -> Self {
        Self {
            metadata: leased.lease.metadata(),
            item: leased.item,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferRequest {
    #[serde(flatten)]
    pub lock: LockMetadata,
    pub priority: i64,
}

// -------------------------
// Domain event store protocol
// -------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteDomainEventsRequest {
    pub domain_events: Vec<DomainEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshotRequest {
    pub snapshot: Snapshot,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayQuery {
    pub from_timestamp: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionQuery {
    pub from_revision: Option<u64>,
    pub to_revision: Option<u64>,
}

/// `?aggregateIdentifier=<json>`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateIdentifierQuery {
    pub aggregate_identifier: String,
}

impl AggregateIdentifierQuery {
    pub fn parse(&self) -> Result<AggregateIdentifier, Response> {
        let identifier: AggregateIdentifier = serde_json::from_str(&self.aggregate_identifier)
            .map_err(|e| {
                errors::json_error(ErrorCode::AggregateIdentifierMalformed, e.to_string())
            })?;
        identifier.validate().map_err(|e| {
            errors::json_error(ErrorCode::AggregateIdentifierMalformed, e.to_string())
        })?;
        Ok(identifier)
    }
}

#[derive(Debug, Deserialize)]
pub struct CausationIdQuery {
    #[serde(rename = "causation-id")]
    pub causation_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CorrelationIdQuery {
    #[serde(rename = "correlation-id")]
    pub correlation_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HasDomainEventsWithCausationIdResponse {
    pub has_domain_events_with_causation_id: bool,
}

// -------------------------
// Replay protocol
// -------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct PerformReplayRequest {
    pub aggregates: Vec<ReplayWindow>,
}

// -------------------------
// Errors
// -------------------------

/// `{ code, message }` body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}
