//! Append-only domain event store boundary.
//!
//! Defines the `DomainEventStore` abstraction, its in-memory and Postgres
//! backends, and an adapter that hands committed events to the dispatcher.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use aeon_core::{AggregateId, AggregateIdentifier, DomainEvent, Snapshot};

use crate::dispatcher::Dispatcher;
use crate::flows::FlowRegistry;
use crate::priority_queue::QueueError;

pub use in_memory::InMemoryDomainEventStore;
pub use postgres::PostgresDomainEventStore;
pub use r#trait::{
    AggregateIdentifierStream, DomainEventStore, DomainEventStoreError, DomainEventStream,
    RevisionRange,
};

/// Adapter that enqueues committed events for their flows after a successful append.
///
/// This ensures the ordering invariant: **enqueue happens only after append
/// succeeds**. An enqueue that fails after the append is logged and left to
/// the recovery loop; the append itself is never rolled back.
pub struct EnqueueingDomainEventStore<S> {
    store: S,
    dispatcher: Arc<Dispatcher>,
    flows: Arc<FlowRegistry>,
}

impl<S> EnqueueingDomainEventStore<S> {
    pub fn new(store: S, dispatcher: Arc<Dispatcher>, flows: Arc<FlowRegistry>) -> Self {
        Self {
            store,
            dispatcher,
            flows,
        }
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}

#[async_trait]
impl<S> DomainEventStore for EnqueueingDomainEventStore<S>
where
    S: DomainEventStore,
{
    async fn setup(&self) -> Result<(), DomainEventStoreError> {
        self.store.setup().await
    }

    async fn destroy(&self) -> Result<(), DomainEventStoreError> {
        self.store.destroy().await
    }

    async fn store_domain_events(
        &self,
        events: Vec<DomainEvent>,
    ) -> Result<(), DomainEventStoreError> {
        // 1) Append (durable step)
        self.store.store_domain_events(events.clone()).await?;

        // 2) Enqueue for every owning flow (at-least-once; recovery fills gaps).
        // After a failed enqueue the rest of that aggregate's batch is held back
        // from the flow so recovery can deliver it in revision order.
        let mut held_back: HashSet<(&str, AggregateId)> = HashSet::new();
        for event in events {
            for discriminator in self.flows.discriminators_for(&event) {
                if held_back.contains(&(discriminator, event.aggregate_id())) {
                    debug!(
                        discriminator,
                        aggregate_id = %event.aggregate_id(),
                        revision = event.revision(),
                        "enqueue held back behind an earlier failure"
                    );
                    continue;
                }

                match self
                    .dispatcher
                    .enqueue(discriminator, event.clone(), event.metadata.timestamp)
                    .await
                {
                    Ok(()) => debug!(
                        discriminator,
                        aggregate_id = %event.aggregate_id(),
                        revision = event.revision(),
                        "enqueued domain event"
                    ),
                    Err(QueueError::ItemAlreadyQueued { .. }) => {}
                    Err(err) => {
                        warn!(
                            discriminator,
                            aggregate_id = %event.aggregate_id(),
                            revision = event.revision(),
                            error = %err,
                            "enqueue after append failed; left for recovery"
                        );
                        held_back.insert((discriminator, event.aggregate_id()));
                    }
                }
            }
        }

        Ok(())
    }

    async fn get_replay(
        &self,
        from_timestamp: Option<i64>,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        self.store.get_replay(from_timestamp).await
    }

    async fn get_replay_for_aggregate(
        &self,
        aggregate_id: AggregateId,
        range: RevisionRange,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        self.store.get_replay_for_aggregate(aggregate_id, range).await
    }

    async fn get_last_domain_event(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> Result<DomainEvent, DomainEventStoreError> {
        self.store.get_last_domain_event(aggregate_identifier).await
    }

    async fn get_domain_events_by_causation_id(
        &self,
        causation_id: Uuid,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        self.store.get_domain_events_by_causation_id(causation_id).await
    }

    async fn get_domain_events_by_correlation_id(
        &self,
        correlation_id: Uuid,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        self.store
            .get_domain_events_by_correlation_id(correlation_id)
            .await
    }

    async fn has_domain_events_with_causation_id(
        &self,
        causation_id: Uuid,
    ) -> Result<bool, DomainEventStoreError> {
        self.store
            .has_domain_events_with_causation_id(causation_id)
            .await
    }

    async fn store_snapshot(&self, snapshot: Snapshot) -> Result<(), DomainEventStoreError> {
        self.store.store_snapshot(snapshot).await
    }

    async fn get_snapshot(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> Result<Option<Snapshot>, DomainEventStoreError> {
        self.store.get_snapshot(aggregate_identifier).await
    }

    async fn get_aggregate_identifiers(
        &self,
    ) -> Result<AggregateIdentifierStream, DomainEventStoreError> {
        self.store.get_aggregate_identifiers().await
    }
}
