use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use uuid::Uuid;

use aeon_core::{AggregateId, AggregateIdentifier, DomainEvent, Snapshot};

use super::r#trait::{
    AggregateIdentifierStream, DomainEventStore, DomainEventStoreError, DomainEventStream,
    RevisionRange, check_batch_revisions,
};

#[derive(Debug, Default)]
struct Storage {
    /// Every event in append order.
    events: Vec<DomainEvent>,
    /// Positions into `events`, indexed by `revision - 1`.
    streams: HashMap<AggregateId, Vec<usize>>,
    /// Aggregates in first-append order.
    aggregates: Vec<AggregateIdentifier>,
    snapshots: HashMap<AggregateId, BTreeMap<u64, Snapshot>>,
}

/// In-memory domain event store.
///
/// Intended for tests/dev. Streams re-acquire the read lock per item, so an
/// open cursor never blocks an append.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDomainEventStore {
    storage: Arc<RwLock<Storage>>,
}

impl InMemoryDomainEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events across all aggregates.
    pub fn len(&self) -> Result<usize, DomainEventStoreError> {
        self.storage
            .read()
            .map(|s| s.events.len())
            .map_err(|_| poisoned())
    }

    pub fn is_empty(&self) -> Result<bool, DomainEventStoreError> {
        Ok(self.len()? == 0)
    }

    /// Cursor over `events` yielding those that match `predicate`.
    fn scan<P>(&self, predicate: P) -> DomainEventStream
    where
        P: Fn(&DomainEvent) -> bool + Send + Sync + 'static,
    {
        let storage = self.storage.clone();
        stream::unfold(Some(0usize), move |cursor| {
            let next = cursor.map(|position| {
                let guard = storage.read().map_err(|_| poisoned())?;
                Ok(guard.events[position..]
                    .iter()
                    .enumerate()
                    .find(|(_, e)| predicate(e))
                    .map(|(offset, e)| (position + offset, e.clone())))
            });
            async move {
                match next? {
                    Ok(Some((position, event))) => Some((Ok(event), Some(position + 1))),
                    Ok(None) => None,
                    Err(err) => Some((Err(err), None)),
                }
            }
        })
        .boxed()
    }
}

fn poisoned() -> DomainEventStoreError {
    DomainEventStoreError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl DomainEventStore for InMemoryDomainEventStore {
    async fn store_domain_events(
        &self,
        events: Vec<DomainEvent>,
    ) -> Result<(), DomainEventStoreError> {
        let mut storage = self.storage.write().map_err(|_| poisoned())?;

        check_batch_revisions(&events, |aggregate_id| {
            storage
                .streams
                .get(&aggregate_id)
                .map(|positions| positions.len() as u64)
                .unwrap_or(0)
        })?;

        for event in events {
            let position = storage.events.len();
            let aggregate_id = event.aggregate_id();
            if !storage.streams.contains_key(&aggregate_id) {
                storage.aggregates.push(event.aggregate_identifier.clone());
            }
            storage.streams.entry(aggregate_id).or_default().push(position);
            storage.events.push(event);
        }

        Ok(())
    }

    async fn get_replay(
        &self,
        from_timestamp: Option<i64>,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        let from = from_timestamp.unwrap_or(0);
        Ok(self.scan(move |e| e.metadata.timestamp >= from))
    }

    async fn get_replay_for_aggregate(
        &self,
        aggregate_id: AggregateId,
        range: RevisionRange,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        let storage = self.storage.clone();
        let to = range.to_revision();

        let replay = stream::unfold(Some(range.from_revision()), move |revision| {
            let next = revision
                .filter(|r| to.is_none_or(|to| *r <= to))
                .map(|revision| {
                    let guard = storage.read().map_err(|_| poisoned())?;
                    Ok(guard
                        .streams
                        .get(&aggregate_id)
                        .and_then(|positions| positions.get((revision - 1) as usize))
                        .map(|position| (revision, guard.events[*position].clone())))
                });
            async move {
                match next? {
                    Ok(Some((revision, event))) => Some((Ok(event), Some(revision + 1))),
                    Ok(None) => None,
                    Err(err) => Some((Err(err), None)),
                }
            }
        });

        Ok(replay.boxed())
    }

    async fn get_last_domain_event(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> Result<DomainEvent, DomainEventStoreError> {
        let storage = self.storage.read().map_err(|_| poisoned())?;
        storage
            .streams
            .get(&aggregate_identifier.id)
            .and_then(|positions| positions.last())
            .map(|position| storage.events[*position].clone())
            .ok_or_else(|| {
                DomainEventStoreError::NotFound(format!(
                    "no domain events for aggregate {}",
                    aggregate_identifier.id
                ))
            })
    }

    async fn get_domain_events_by_causation_id(
        &self,
        causation_id: Uuid,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        Ok(self.scan(move |e| e.metadata.causation_id == causation_id))
    }

    async fn get_domain_events_by_correlation_id(
        &self,
        correlation_id: Uuid,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        Ok(self.scan(move |e| e.metadata.correlation_id == correlation_id))
    }

    async fn has_domain_events_with_causation_id(
        &self,
        causation_id: Uuid,
    ) -> Result<bool, DomainEventStoreError> {
        let storage = self.storage.read().map_err(|_| poisoned())?;
        Ok(storage
            .events
            .iter()
            .any(|e| e.metadata.causation_id == causation_id))
    }

    async fn store_snapshot(&self, snapshot: Snapshot) -> Result<(), DomainEventStoreError> {
        snapshot.validate()?;
        let mut storage = self.storage.write().map_err(|_| poisoned())?;
        storage
            .snapshots
            .entry(snapshot.aggregate_identifier.id)
            .or_default()
            .insert(snapshot.revision, snapshot);
        Ok(())
    }

    async fn get_snapshot(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> Result<Option<Snapshot>, DomainEventStoreError> {
        let storage = self.storage.read().map_err(|_| poisoned())?;
        Ok(storage
            .snapshots
            .get(&aggregate_identifier.id)
            .and_then(|by_revision| by_revision.values().next_back())
            .cloned())
    }

    async fn get_aggregate_identifiers(
        &self,
    ) -> Result<AggregateIdentifierStream, DomainEventStoreError> {
        let aggregates = self
            .storage
            .read()
            .map_err(|_| poisoned())?
            .aggregates
            .clone();
        Ok(stream::iter(aggregates.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aeon_core::ContextIdentifier;
    use futures::TryStreamExt;

    fn aggregate(id: AggregateId) -> AggregateIdentifier {
        AggregateIdentifier::new("sampleAggregate", id)
    }

    fn event(id: AggregateId, revision: u64) -> DomainEvent {
        DomainEvent::new(
            ContextIdentifier::new("sampleContext"),
            aggregate(id),
            "executed",
            serde_json::json!({ "revision": revision }),
            revision,
        )
    }

    async fn seed(store: &InMemoryDomainEventStore, id: AggregateId, revisions: u64) {
        let events = (1..=revisions).map(|r| event(id, r)).collect();
        store.store_domain_events(events).await.unwrap();
    }

    fn revisions(events: &[DomainEvent]) -> Vec<u64> {
        events.iter().map(|e| e.revision()).collect()
    }

    #[tokio::test]
    async fn replay_for_aggregate_honors_window() {
        let store = InMemoryDomainEventStore::new();
        let id = AggregateId::new();
        seed(&store, id, 5).await;

        let range = RevisionRange::new(Some(2), Some(4)).unwrap();
        let events: Vec<_> = store
            .get_replay_for_aggregate(id, range)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(revisions(&events), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn replay_for_unknown_aggregate_is_empty() {
        let store = InMemoryDomainEventStore::new();
        let events: Vec<_> = store
            .get_replay_for_aggregate(AggregateId::new(), RevisionRange::all())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn append_conflicts_are_rejected_atomically() {
        let store = InMemoryDomainEventStore::new();
        let id = AggregateId::new();
        seed(&store, id, 2).await;

        let other = AggregateId::new();
        let result = store
            .store_domain_events(vec![event(other, 1), event(id, 2)])
            .await;

        assert!(matches!(
            result,
            Err(DomainEventStoreError::RevisionAlreadyExists(_))
        ));
        // The valid half of the batch must not have been persisted.
        assert_eq!(store.len().unwrap(), 2);
        assert!(store.get_last_domain_event(&aggregate(other)).await.is_err());
    }

    #[tokio::test]
    async fn last_domain_event_has_greatest_revision() {
        let store = InMemoryDomainEventStore::new();
        let id = AggregateId::new();
        seed(&store, id, 3).await;

        let last = store.get_last_domain_event(&aggregate(id)).await.unwrap();
        assert_eq!(last.revision(), 3);

        let missing = store
            .get_last_domain_event(&aggregate(AggregateId::new()))
            .await;
        assert!(matches!(missing, Err(DomainEventStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn replay_filters_by_timestamp() {
        let store = InMemoryDomainEventStore::new();
        let id = AggregateId::new();
        store
            .store_domain_events(vec![
                event(id, 1).with_timestamp(100),
                event(id, 2).with_timestamp(200),
                event(id, 3).with_timestamp(300),
            ])
            .await
            .unwrap();

        let events: Vec<_> = store
            .get_replay(Some(200))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(revisions(&events), vec![2, 3]);
    }

    #[tokio::test]
    async fn causation_and_correlation_lookups() {
        let store = InMemoryDomainEventStore::new();
        let id = AggregateId::new();
        let causation = Uuid::new_v4();
        let correlation = Uuid::new_v4();
        store
            .store_domain_events(vec![
                event(id, 1).with_causation_id(causation),
                event(id, 2).with_correlation_id(correlation),
                event(id, 3).with_causation_id(causation).with_correlation_id(correlation),
            ])
            .await
            .unwrap();

        let caused: Vec<_> = store
            .get_domain_events_by_causation_id(causation)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(revisions(&caused), vec![1, 3]);

        let correlated: Vec<_> = store
            .get_domain_events_by_correlation_id(correlation)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(revisions(&correlated), vec![2, 3]);

        assert!(store.has_domain_events_with_causation_id(causation).await.unwrap());
        assert!(!store
            .has_domain_events_with_causation_id(Uuid::new_v4())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn open_cursor_does_not_block_appends() {
        let store = InMemoryDomainEventStore::new();
        let id = AggregateId::new();
        seed(&store, id, 1).await;

        let mut replay = store.get_replay(None).await.unwrap();
        let first = replay.next().await.unwrap().unwrap();
        assert_eq!(first.revision(), 1);

        store.store_domain_events(vec![event(id, 2)]).await.unwrap();
        let second = replay.next().await.unwrap().unwrap();
        assert_eq!(second.revision(), 2);
        assert!(replay.next().await.is_none());
    }

    #[tokio::test]
    async fn snapshot_returns_greatest_revision() {
        let store = InMemoryDomainEventStore::new();
        let id = AggregateId::new();

        store
            .store_snapshot(Snapshot::new(aggregate(id), 5, serde_json::json!({ "n": 5 })))
            .await
            .unwrap();
        store
            .store_snapshot(Snapshot::new(aggregate(id), 2, serde_json::json!({ "n": 2 })))
            .await
            .unwrap();
        store
            .store_snapshot(Snapshot::new(aggregate(id), 5, serde_json::json!({ "n": 50 })))
            .await
            .unwrap();

        let snapshot = store.get_snapshot(&aggregate(id)).await.unwrap().unwrap();
        assert_eq!(snapshot.revision, 5);
        assert_eq!(snapshot.state["n"], 50);

        assert!(store
            .get_snapshot(&aggregate(AggregateId::new()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn aggregate_identifiers_in_first_append_order() {
        let store = InMemoryDomainEventStore::new();
        let first = AggregateId::new();
        let second = AggregateId::new();
        seed(&store, first, 1).await;
        seed(&store, second, 2).await;
        store.store_domain_events(vec![event(first, 2)]).await.unwrap();

        let ids: Vec<_> = store
            .get_aggregate_identifiers()
            .await
            .unwrap()
            .map_ok(|a| a.id)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn poisoned_lock_is_reported_by_len() {
        let store = InMemoryDomainEventStore::new();
        let holder = store.clone();
        let _ = std::thread::spawn(move || {
            let _storage = holder.storage.write().unwrap();
            panic!("poison the storage lock");
        })
        .join();

        assert!(matches!(store.len(), Err(DomainEventStoreError::Storage(_))));
    }
}
