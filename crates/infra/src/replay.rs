//! Replay coordination: re-enqueue stored events on request.
//!
//! A replay request names revision windows per aggregate. Every window is
//! validated before anything is read, then each event in each window is
//! enqueued for every flow that subscribes to it, with its original timestamp
//! as priority. Events still waiting in a lane are skipped, not duplicated.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use aeon_core::{AggregateIdentifier, ContextIdentifier};

use crate::dispatcher::Dispatcher;
use crate::domain_event_store::{DomainEventStore, DomainEventStoreError, RevisionRange};
use crate::flows::FlowRegistry;
use crate::priority_queue::QueueError;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("invalid replay request: {0}")]
    Validation(String),

    #[error("domain event store error: {0}")]
    Store(#[from] DomainEventStoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// One aggregate's revision window, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayWindow {
    pub context_identifier: ContextIdentifier,
    pub aggregate_identifier: AggregateIdentifier,
    pub from: u64,
    pub to: u64,
}

impl ReplayWindow {
    fn range(&self) -> Result<RevisionRange, ReplayError> {
        self.aggregate_identifier
            .validate()
            .map_err(|e| ReplayError::Validation(e.to_string()))?;
        RevisionRange::new(Some(self.from), Some(self.to)).map_err(|e| {
            ReplayError::Validation(format!(
                "aggregate {}: {}",
                self.aggregate_identifier.id, e
            ))
        })
    }
}

/// Outcome of a replay request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub enqueued: usize,
    pub already_queued: usize,
}

pub struct ReplayCoordinator {
    store: Arc<dyn DomainEventStore>,
    dispatcher: Arc<Dispatcher>,
    flows: Arc<FlowRegistry>,
}

impl ReplayCoordinator {
    pub fn new(
        store: Arc<dyn DomainEventStore>,
        dispatcher: Arc<Dispatcher>,
        flows: Arc<FlowRegistry>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            flows,
        }
    }

    #[instrument(skip(self, windows), fields(window_count = windows.len()), err)]
    pub async fn perform_replay(&self, windows: &[ReplayWindow]) -> Result<ReplayReport, ReplayError> {
        let ranges = windows
            .iter()
            .map(|window| window.range().map(|range| (window, range)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut report = ReplayReport::default();
        for (window, range) in ranges {
            let mut events = self
                .store
                .get_replay_for_aggregate(window.aggregate_identifier.id, range)
                .await?;

            while let Some(event) = events.next().await {
                let event = event?;
                if event.context_identifier != window.context_identifier {
                    debug!(
                        aggregate_id = %window.aggregate_identifier.id,
                        revision = event.revision(),
                        "skipping event from another context"
                    );
                    continue;
                }

                for discriminator in self.flows.discriminators_for(&event) {
                    match self
                        .dispatcher
                        .enqueue(discriminator, event.clone(), event.metadata.timestamp)
                        .await
                    {
                        Ok(()) => report.enqueued += 1,
                        Err(QueueError::ItemAlreadyQueued { .. }) => report.already_queued += 1,
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }

        info!(
            enqueued = report.enqueued,
            already_queued = report.already_queued,
            "replay performed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::domain_event_store::InMemoryDomainEventStore;
    use crate::priority_queue::InMemoryPriorityQueueStore;
    use crate::progress::InMemoryConsumerProgressStore;
    use aeon_core::{AggregateId, DomainEvent};
    use std::time::Duration;

    fn identifier(id: AggregateId) -> AggregateIdentifier {
        AggregateIdentifier::new("sampleAggregate", id)
    }

    fn event(id: AggregateId, revision: u64) -> DomainEvent {
        DomainEvent::new(
            ContextIdentifier::new("sampleContext"),
            identifier(id),
            "executed",
            serde_json::json!({}),
            revision,
        )
    }

    fn window(id: AggregateId, from: u64, to: u64) -> ReplayWindow {
        ReplayWindow {
            context_identifier: ContextIdentifier::new("sampleContext"),
            aggregate_identifier: identifier(id),
            from,
            to,
        }
    }

    async fn coordinator() -> (ReplayCoordinator, Arc<Dispatcher>, AggregateId) {
        let store = Arc::new(InMemoryDomainEventStore::new());
        let id = AggregateId::new();
        store
            .store_domain_events((1..=4).map(|r| event(id, r)).collect())
            .await
            .unwrap();

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(InMemoryPriorityQueueStore::new(Duration::from_secs(60))),
            Arc::new(InMemoryConsumerProgressStore::new()),
            DispatcherConfig::default(),
        ));
        let flows = Arc::new(
            FlowRegistry::new()
                .with_flow("sampleFlow", ["sampleContext.sampleAggregate.*"])
                .unwrap(),
        );
        (
            ReplayCoordinator::new(store, dispatcher.clone(), flows),
            dispatcher,
            id,
        )
    }

    #[tokio::test]
    async fn replays_window_in_revision_order() {
        let (coordinator, dispatcher, id) = coordinator().await;

        let report = coordinator.perform_replay(&[window(id, 2, 3)]).await.unwrap();
        assert_eq!(report.enqueued, 2);

        let first = dispatcher.try_lease().await.unwrap().unwrap();
        assert_eq!(first.lease.discriminator, "sampleFlow");
        assert_eq!(first.item.revision(), 2);
        dispatcher
            .acknowledge("sampleFlow", first.lease.token)
            .await
            .unwrap();

        let second = dispatcher.try_lease().await.unwrap().unwrap();
        assert_eq!(second.item.revision(), 3);
    }

    #[tokio::test]
    async fn invalid_window_rejects_whole_request() {
        let (coordinator, dispatcher, id) = coordinator().await;

        let result = coordinator
            .perform_replay(&[window(id, 1, 2), window(id, 4, 2)])
            .await;
        assert!(matches!(result, Err(ReplayError::Validation(_))));
        assert!(dispatcher.try_lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queued_events_are_not_duplicated() {
        let (coordinator, _, id) = coordinator().await;

        coordinator.perform_replay(&[window(id, 1, 2)]).await.unwrap();
        let report = coordinator.perform_replay(&[window(id, 1, 3)]).await.unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(report.already_queued, 2);
    }
}
