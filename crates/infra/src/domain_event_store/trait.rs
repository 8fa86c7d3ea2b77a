use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

use aeon_core::{AggregateId, AggregateIdentifier, CoreError, DomainEvent, ErrorCode, Snapshot};

/// Lazy, forward-only sequence of stored events.
///
/// Every call to a read operation opens a fresh cursor; dropping the stream
/// releases it.
pub type DomainEventStream = BoxStream<'static, Result<DomainEvent, DomainEventStoreError>>;

/// Lazy sequence of aggregate identifiers, in first-append order.
pub type AggregateIdentifierStream =
    BoxStream<'static, Result<AggregateIdentifier, DomainEventStoreError>>;

/// Domain event store operation error.
///
/// ## Error Categories
///
/// - **Validation**: input rejected before touching storage
/// - **RevisionAlreadyExists**: an (aggregate, revision) pair is already stored
/// - **RevisionGap**: a batch would leave a hole in an aggregate's revisions
/// - **NotFound**: no event/snapshot for the requested aggregate
/// - **Storage**: backend failure (connection, decoding, poisoned lock)
#[derive(Debug, Error)]
pub enum DomainEventStoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("revision already exists: {0}")]
    RevisionAlreadyExists(String),

    #[error("revision gap: {0}")]
    RevisionGap(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl DomainEventStoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DomainEventStoreError::Validation(_) => ErrorCode::RequestMalformed,
            DomainEventStoreError::RevisionAlreadyExists(_) => ErrorCode::RevisionAlreadyExists,
            DomainEventStoreError::RevisionGap(_) => ErrorCode::RevisionGap,
            DomainEventStoreError::NotFound(_) => ErrorCode::NotFound,
            DomainEventStoreError::Storage(_) => ErrorCode::UnknownError,
        }
    }
}

impl From<CoreError> for DomainEventStoreError {
    fn from(err: CoreError) -> Self {
        DomainEventStoreError::Validation(err.to_string())
    }
}

/// Inclusive, 1-based revision window for aggregate replays.
///
/// Constructing one is the only way to call `get_replay_for_aggregate`, so an
/// inverted or zero-based window never reaches a backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct RevisionRange {
    from: Option<u64>,
    to: Option<u64>,
}

impl RevisionRange {
    pub fn new(from: Option<u64>, to: Option<u64>) -> Result<Self, DomainEventStoreError> {
        if from == Some(0) {
            return Err(DomainEventStoreError::Validation(
                "fromRevision must be at least 1".to_string(),
            ));
        }
        if to == Some(0) {
            return Err(DomainEventStoreError::Validation(
                "toRevision must be at least 1".to_string(),
            ));
        }
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(DomainEventStoreError::Validation(
                    "toRevision must be greater or equal to fromRevision".to_string(),
                ));
            }
        }
        Ok(Self { from, to })
    }

    /// Every revision of the aggregate.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from_revision(&self) -> u64 {
        self.from.unwrap_or(1)
    }

    pub fn to_revision(&self) -> Option<u64> {
        self.to
    }

    pub fn contains(&self, revision: u64) -> bool {
        revision >= self.from_revision() && self.to.is_none_or(|to| revision <= to)
    }
}

/// Append-only domain event store.
///
/// ## Append Semantics
///
/// `store_domain_events()`:
/// - validates every event structurally
/// - requires each aggregate's revisions in the batch to continue its stream
///   contiguously (`current + 1`, `current + 2`, ...)
/// - persists the whole batch atomically (all or nothing)
/// - rejects, never queues, a conflicting concurrent append
///
/// ## Read Semantics
///
/// All streaming reads are lazy forward-only cursors that hold no lock between
/// items; events appended while a read is running may or may not be observed.
///
/// ## Lifecycle
///
/// Backends are constructed explicitly and injected. `setup()` prepares the
/// backing storage, `destroy()` releases it.
#[async_trait]
pub trait DomainEventStore: Send + Sync {
    async fn setup(&self) -> Result<(), DomainEventStoreError> {
        Ok(())
    }

    async fn destroy(&self) -> Result<(), DomainEventStoreError> {
        Ok(())
    }

    /// Atomically append a batch of events (may span aggregates).
    async fn store_domain_events(&self, events: Vec<DomainEvent>)
    -> Result<(), DomainEventStoreError>;

    /// Every event with `metadata.timestamp >= from_timestamp`, in storage order.
    async fn get_replay(
        &self,
        from_timestamp: Option<i64>,
    ) -> Result<DomainEventStream, DomainEventStoreError>;

    /// One aggregate's events inside `range`, in revision order.
    ///
    /// The stream ends as soon as `range.to_revision()` has been yielded.
    async fn get_replay_for_aggregate(
        &self,
        aggregate_id: AggregateId,
        range: RevisionRange,
    ) -> Result<DomainEventStream, DomainEventStoreError>;

    /// The greatest-revision event of an aggregate, or `NotFound`.
    async fn get_last_domain_event(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> Result<DomainEvent, DomainEventStoreError>;

    async fn get_domain_events_by_causation_id(
        &self,
        causation_id: Uuid,
    ) -> Result<DomainEventStream, DomainEventStoreError>;

    async fn get_domain_events_by_correlation_id(
        &self,
        correlation_id: Uuid,
    ) -> Result<DomainEventStream, DomainEventStoreError>;

    async fn has_domain_events_with_causation_id(
        &self,
        causation_id: Uuid,
    ) -> Result<bool, DomainEventStoreError>;

    /// Store a snapshot; a snapshot at an existing revision is replaced.
    async fn store_snapshot(&self, snapshot: Snapshot) -> Result<(), DomainEventStoreError>;

    /// The greatest-revision snapshot of an aggregate, if any.
    async fn get_snapshot(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> Result<Option<Snapshot>, DomainEventStoreError>;

    /// Every aggregate that has at least one event.
    async fn get_aggregate_identifiers(
        &self,
    ) -> Result<AggregateIdentifierStream, DomainEventStoreError>;
}

#[async_trait]
impl<S> DomainEventStore for Arc<S>
where
    S: DomainEventStore + ?Sized,
{
    async fn setup(&self) -> Result<(), DomainEventStoreError> {
        (**self).setup().await
    }

    async fn destroy(&self) -> Result<(), DomainEventStoreError> {
        (**self).destroy().await
    }

    async fn store_domain_events(
        &self,
        events: Vec<DomainEvent>,
    ) -> Result<(), DomainEventStoreError> {
        (**self).store_domain_events(events).await
    }

    async fn get_replay(
        &self,
        from_timestamp: Option<i64>,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        (**self).get_replay(from_timestamp).await
    }

    async fn get_replay_for_aggregate(
        &self,
        aggregate_id: AggregateId,
        range: RevisionRange,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        (**self).get_replay_for_aggregate(aggregate_id, range).await
    }

    async fn get_last_domain_event(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> Result<DomainEvent, DomainEventStoreError> {
        (**self).get_last_domain_event(aggregate_identifier).await
    }

    async fn get_domain_events_by_causation_id(
        &self,
        causation_id: Uuid,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        (**self).get_domain_events_by_causation_id(causation_id).await
    }

    async fn get_domain_events_by_correlation_id(
        &self,
        correlation_id: Uuid,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        (**self).get_domain_events_by_correlation_id(correlation_id).await
    }

    async fn has_domain_events_with_causation_id(
        &self,
        causation_id: Uuid,
    ) -> Result<bool, DomainEventStoreError> {
        (**self).has_domain_events_with_causation_id(causation_id).await
    }

    async fn store_snapshot(&self, snapshot: Snapshot) -> Result<(), DomainEventStoreError> {
        (**self).store_snapshot(snapshot).await
    }

    async fn get_snapshot(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> Result<Option<Snapshot>, DomainEventStoreError> {
        (**self).get_snapshot(aggregate_identifier).await
    }

    async fn get_aggregate_identifiers(
        &self,
    ) -> Result<AggregateIdentifierStream, DomainEventStoreError> {
        (**self).get_aggregate_identifiers().await
    }
}

/// Check a batch against the current revision of every aggregate it touches.
///
/// `current_revision` returns 0 for an aggregate without events.
pub(crate) fn check_batch_revisions<F>(
    events: &[DomainEvent],
    mut current_revision: F,
) -> Result<(), DomainEventStoreError>
where
    F: FnMut(AggregateId) -> u64,
{
    if events.is_empty() {
        return Err(DomainEventStoreError::Validation(
            "domain events are missing".to_string(),
        ));
    }

    let mut expected: HashMap<AggregateId, u64> = HashMap::new();
    for event in events {
        event.validate()?;

        let aggregate_id = event.aggregate_id();
        let next = expected
            .entry(aggregate_id)
            .or_insert_with(|| current_revision(aggregate_id) + 1);
        let revision = event.revision();

        if revision < *next {
            return Err(DomainEventStoreError::RevisionAlreadyExists(format!(
                "aggregate {aggregate_id} already has revision {revision}"
            )));
        }
        if revision > *next {
            return Err(DomainEventStoreError::RevisionGap(format!(
                "aggregate {aggregate_id} expects revision {next}, got {revision}"
            )));
        }
        *next += 1;
    }

    Ok(())
}
