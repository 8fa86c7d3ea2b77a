//! Missed-event recovery loop.
//!
//! Appending an event and enqueueing it are separate steps; a crash or a
//! transient queue failure between them loses the enqueue. On every tick the
//! recovery loop:
//! 1. drops expired leases (their heads become leasable again)
//! 2. for each aggregate and flow, walks the stored revisions above the
//!    flow's progress watermark
//! 3. re-enqueues every routed revision that was neither acknowledged nor is
//!    still queued, and moves the watermark over the settled prefix
//!
//! Every step is idempotent, so a tick can be repeated or interrupted safely.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::domain_event_store::{DomainEventStore, DomainEventStoreError, RevisionRange};
use crate::flows::FlowRegistry;
use crate::priority_queue::QueueError;
use crate::progress::{ConsumerProgressStore, ProgressError};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("domain event store error: {0}")]
    Store(#[from] DomainEventStoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("progress store error: {0}")]
    Progress(#[from] ProgressError),
}

/// Outcome of one recovery tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub expired_leases: usize,
    pub aggregates_checked: usize,
    pub re_enqueued: usize,
    pub already_queued: usize,
}

pub struct RecoveryLoop {
    store: Arc<dyn DomainEventStore>,
    dispatcher: Arc<Dispatcher>,
    progress: Arc<dyn ConsumerProgressStore>,
    flows: Arc<FlowRegistry>,
}

/// Handle to stop a running recovery loop.
#[derive(Debug)]
pub struct RecoveryHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl RecoveryHandle {
    /// Request graceful shutdown and wait for the current tick to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.join.await;
    }
}

impl RecoveryLoop {
    pub fn new(
        store: Arc<dyn DomainEventStore>,
        dispatcher: Arc<Dispatcher>,
        progress: Arc<dyn ConsumerProgressStore>,
        flows: Arc<FlowRegistry>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            progress,
            flows,
        }
    }

    /// Run `run_once` every `interval` until shut down.
    ///
    /// A failed tick is logged and retried on the next one.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> RecoveryHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_ms = interval.as_millis() as u64, "recovery loop started");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(report) if report.re_enqueued > 0 || report.expired_leases > 0 => {
                                info!(
                                    expired_leases = report.expired_leases,
                                    re_enqueued = report.re_enqueued,
                                    already_queued = report.already_queued,
                                    aggregates_checked = report.aggregates_checked,
                                    "recovery tick"
                                );
                            }
                            Ok(report) => debug!(
                                aggregates_checked = report.aggregates_checked,
                                "recovery tick found nothing to do"
                            ),
                            Err(err) => warn!(error = %err, "recovery tick failed"),
                        }
                    }
                }
            }
            info!("recovery loop stopped");
        });

        RecoveryHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    pub async fn run_once(&self) -> Result<RecoveryReport, RecoveryError> {
        let mut report = RecoveryReport::default();

        for lease in self.dispatcher.sweep_expired_locks().await? {
            warn!(
                discriminator = %lease.discriminator,
                token = %lease.token,
                expired_at = %lease.expires_at,
                "lease expired without acknowledgement; item is leasable again"
            );
            report.expired_leases += 1;
        }

        if self.flows.is_empty() {
            return Ok(report);
        }

        let mut aggregates = self.store.get_aggregate_identifiers().await?;
        while let Some(aggregate) = aggregates.next().await {
            let aggregate = aggregate?;
            report.aggregates_checked += 1;

            let latest = match self.store.get_last_domain_event(&aggregate).await {
                Ok(event) => event.revision(),
                Err(DomainEventStoreError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            };

            for discriminator in self.flows.discriminators() {
                let progress = self
                    .progress
                    .get_progress(discriminator, aggregate.id)
                    .await?;
                if progress.watermark >= latest {
                    continue;
                }

                let range = RevisionRange::new(Some(progress.watermark + 1), Some(latest))?;
                let mut pending = self
                    .store
                    .get_replay_for_aggregate(aggregate.id, range)
                    .await?;

                // Settled revisions directly above the watermark move it up;
                // the first unsettled routed revision stops that.
                let mut settled_up_to = progress.watermark;
                let mut contiguous = true;

                while let Some(event) = pending.next().await {
                    let event = event?;
                    let revision = event.revision();

                    if !self.flows.routes_to(&event, discriminator) || progress.is_settled(revision) {
                        if contiguous {
                            settled_up_to = revision;
                        }
                        continue;
                    }
                    contiguous = false;

                    let priority = event.metadata.timestamp;
                    match self.dispatcher.enqueue(discriminator, event, priority).await {
                        Ok(()) => {
                            info!(
                                discriminator,
                                aggregate_id = %aggregate.id,
                                revision,
                                "re-enqueued missed domain event"
                            );
                            report.re_enqueued += 1;
                        }
                        Err(QueueError::ItemAlreadyQueued { .. }) => report.already_queued += 1,
                        Err(err) => return Err(err.into()),
                    }
                }

                if settled_up_to > progress.watermark {
                    self.progress
                        .advance_watermark(discriminator, aggregate.id, settled_up_to)
                        .await?;
                }
            }
        }

        Ok(report)
    }
}
