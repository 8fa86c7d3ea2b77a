//! Integration tests for the full event pipeline.
//!
//! Tests: append → EnqueueingDomainEventStore → PriorityQueue → Dispatcher
//!
//! Verifies:
//! - Appended events reach every owning flow in revision order
//! - Rejected appends never reach the queue
//! - Deferred items yield their lane to the next item
//! - A failed enqueue holds back the rest of the aggregate until recovery

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use aeon_core::{AggregateId, AggregateIdentifier, ContextIdentifier, DomainEvent, LeaseToken, LockLease};

    use crate::dispatcher::{Dispatcher, DispatcherConfig};
    use crate::domain_event_store::{
        DomainEventStore, DomainEventStoreError, EnqueueingDomainEventStore,
        InMemoryDomainEventStore,
    };
    use crate::flows::FlowRegistry;
    use crate::priority_queue::{
        InMemoryPriorityQueueStore, LeasedItem, PriorityQueueStore, QueueError,
    };
    use crate::progress::InMemoryConsumerProgressStore;
    use crate::recovery::RecoveryLoop;

    /// In-memory queue whose enqueue fails once for one revision.
    struct FailingOnceQueue {
        inner: InMemoryPriorityQueueStore<DomainEvent>,
        fail_revision: std::sync::Mutex<Option<u64>>,
    }

    #[async_trait]
    impl PriorityQueueStore<DomainEvent> for FailingOnceQueue {
        async fn enqueue(&self, discriminator: &str, item: DomainEvent, priority: i64) -> Result<(), QueueError> {
            let fail_now = {
                let mut fail = self.fail_revision.lock().unwrap();
                if *fail == Some(item.revision()) {
                    *fail = None;
                    true
                } else {
                    false
                }
            };
            if fail_now {
                return Err(QueueError::Storage("connection reset".to_string()));
            }
            self.inner.enqueue(discriminator, item, priority).await
        }

        async fn lease(&self) -> Result<Option<LeasedItem<DomainEvent>>, QueueError> {
            self.inner.lease().await
        }

        async fn renew_lock(&self, discriminator: &str, token: LeaseToken) -> Result<(), QueueError> {
            self.inner.renew_lock(discriminator, token).await
        }

        async fn release_lock(&self, discriminator: &str, token: LeaseToken) -> Result<(), QueueError> {
            self.inner.release_lock(discriminator, token).await
        }

        async fn acknowledge(&self, discriminator: &str, token: LeaseToken) -> Result<DomainEvent, QueueError> {
            self.inner.acknowledge(discriminator, token).await
        }

        async fn defer(&self, discriminator: &str, token: LeaseToken, priority: i64) -> Result<(), QueueError> {
            self.inner.defer(discriminator, token, priority).await
        }

        async fn sweep_expired_locks(&self) -> Result<Vec<LockLease>, QueueError> {
            self.inner.sweep_expired_locks().await
        }

        async fn is_queued(&self, discriminator: &str, item_key: &str) -> Result<bool, QueueError> {
            self.inner.is_queued(discriminator, item_key).await
        }
    }

    fn event(context: &str, id: AggregateId, revision: u64) -> DomainEvent {
        DomainEvent::new(
            ContextIdentifier::new(context),
            AggregateIdentifier::new("sampleAggregate", id),
            "executed",
            serde_json::json!({ "revision": revision }),
            revision,
        )
        .with_timestamp(revision as i64)
    }

    fn setup(flows: FlowRegistry) -> (EnqueueingDomainEventStore<InMemoryDomainEventStore>, Arc<Dispatcher>) {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(InMemoryPriorityQueueStore::new(Duration::from_secs(60))),
            Arc::new(InMemoryConsumerProgressStore::new()),
            DispatcherConfig::default(),
        ));
        let store = EnqueueingDomainEventStore::new(
            InMemoryDomainEventStore::new(),
            dispatcher.clone(),
            Arc::new(flows),
        );
        (store, dispatcher)
    }

    fn flow_x() -> FlowRegistry {
        FlowRegistry::new()
            .with_flow("flowX", ["sampleContext.sampleAggregate.*"])
            .unwrap()
    }

    #[tokio::test]
    async fn lease_ack_defer_cycle_preserves_lane_order() {
        let (store, dispatcher) = setup(flow_x());
        let id = AggregateId::new();
        store
            .store_domain_events((1..=4).map(|r| event("sampleContext", id, r)).collect())
            .await
            .unwrap();

        let first = dispatcher.try_lease().await.unwrap().unwrap();
        assert_eq!(first.item.revision(), 1);
        dispatcher.acknowledge("flowX", first.lease.token).await.unwrap();

        let second = dispatcher.try_lease().await.unwrap().unwrap();
        assert_eq!(second.item.revision(), 2);
        dispatcher
            .defer("flowX", second.lease.token, 1_000)
            .await
            .unwrap();

        let third = dispatcher.try_lease().await.unwrap().unwrap();
        assert_eq!(third.item.revision(), 3);
        dispatcher.acknowledge("flowX", third.lease.token).await.unwrap();

        let fourth = dispatcher.try_lease().await.unwrap().unwrap();
        assert_eq!(fourth.item.revision(), 4);
        dispatcher.acknowledge("flowX", fourth.lease.token).await.unwrap();

        let deferred = dispatcher.try_lease().await.unwrap().unwrap();
        assert_eq!(deferred.item.revision(), 2);
        assert_eq!(deferred.priority, 1_000);
    }

    #[tokio::test]
    async fn rejected_append_is_not_enqueued() {
        let (store, dispatcher) = setup(flow_x());
        let id = AggregateId::new();
        store
            .store_domain_events(vec![event("sampleContext", id, 1)])
            .await
            .unwrap();

        let leased = dispatcher.try_lease().await.unwrap().unwrap();
        dispatcher.acknowledge("flowX", leased.lease.token).await.unwrap();

        let result = store
            .store_domain_events(vec![event("sampleContext", id, 1)])
            .await;
        assert!(matches!(
            result,
            Err(DomainEventStoreError::RevisionAlreadyExists(_))
        ));
        assert!(dispatcher.try_lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn events_fan_out_to_every_owning_flow() {
        let flows = flow_x().with_flow("audit", ["*.*.*"]).unwrap();
        let (store, dispatcher) = setup(flows);
        let id = AggregateId::new();
        store
            .store_domain_events(vec![
                event("sampleContext", id, 1),
                event("otherContext", AggregateId::new(), 1),
            ])
            .await
            .unwrap();

        let mut leased = Vec::new();
        while let Some(item) = dispatcher.try_lease().await.unwrap() {
            leased.push((item.lease.discriminator.clone(), item.item.context_identifier.name.clone()));
        }
        leased.sort();

        // audit's lane leases one item at a time, so only its head shows up.
        assert_eq!(
            leased,
            vec![
                ("audit".to_string(), "sampleContext".to_string()),
                ("flowX".to_string(), "sampleContext".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn unrouted_events_are_stored_but_not_queued() {
        let (store, dispatcher) = setup(flow_x());
        store
            .store_domain_events(vec![event("otherContext", AggregateId::new(), 1)])
            .await
            .unwrap();

        assert!(dispatcher.try_lease().await.unwrap().is_none());
        let replayed = store.get_replay(None).await.unwrap();
        use futures::StreamExt;
        assert_eq!(replayed.count().await, 1);
    }

    #[tokio::test]
    async fn failed_enqueue_holds_back_later_revisions_until_recovery() {
        let progress = Arc::new(InMemoryConsumerProgressStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(FailingOnceQueue {
                inner: InMemoryPriorityQueueStore::new(Duration::from_secs(60)),
                fail_revision: std::sync::Mutex::new(Some(2)),
            }),
            progress.clone(),
            DispatcherConfig::default(),
        ));
        let flows = Arc::new(flow_x());
        let inner = Arc::new(InMemoryDomainEventStore::new());
        let store = EnqueueingDomainEventStore::new(inner.clone(), dispatcher.clone(), flows.clone());
        let recovery = RecoveryLoop::new(inner, dispatcher.clone(), progress, flows);

        let id = AggregateId::new();
        store
            .store_domain_events((1..=3).map(|r| event("sampleContext", id, r)).collect())
            .await
            .unwrap();

        let first = dispatcher.try_lease().await.unwrap().unwrap();
        assert_eq!(first.item.revision(), 1);
        dispatcher.acknowledge("flowX", first.lease.token).await.unwrap();
        // Revision 3 must not overtake the lost revision 2.
        assert!(dispatcher.try_lease().await.unwrap().is_none());

        let report = recovery.run_once().await.unwrap();
        assert_eq!(report.re_enqueued, 2);

        for expected in [2, 3] {
            let leased = dispatcher.try_lease().await.unwrap().unwrap();
            assert_eq!(leased.item.revision(), expected);
            dispatcher.acknowledge("flowX", leased.lease.token).await.unwrap();
        }
        assert_eq!(recovery.run_once().await.unwrap().re_enqueued, 0);
    }
}
