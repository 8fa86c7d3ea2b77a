//! Dispatcher: the consumer-facing side of the domain event queue.
//!
//! Wraps a `PriorityQueueStore<DomainEvent>` with:
//! - blocking `await_item()` (woken on enqueue, with a poll fallback for
//!   enqueues made by other processes)
//! - consumer progress tracking on acknowledge
//! - a heartbeat-framed stream for HTTP consumers that releases the lease if
//!   the consumer disconnects before the item was handed over

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use aeon_core::{DomainEvent, LeaseToken, LockLease};

use crate::priority_queue::{LeasedItem, PriorityQueueStore, QueueError, QueueItem};
use crate::progress::ConsumerProgressStore;
use crate::streaming::Frame;

pub type LeasedDomainEvent = LeasedItem<DomainEvent>;

/// Frames buffered between the producer and the HTTP body. With one slot the
/// item is only buffered once the consumer has pulled the previous frame; a
/// consumer that stops reading before that gets its lease released.
const HANDOFF_BUFFER: usize = 1;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long `await_item` sleeps between lease attempts without a wake-up.
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct Dispatcher {
    queue: Arc<dyn PriorityQueueStore<DomainEvent>>,
    progress: Arc<dyn ConsumerProgressStore>,
    new_item: Notify,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn PriorityQueueStore<DomainEvent>>,
        progress: Arc<dyn ConsumerProgressStore>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            progress,
            new_item: Notify::new(),
            config,
        }
    }

    /// Enqueue under `discriminator` and wake waiting consumers.
    pub async fn enqueue(
        &self,
        discriminator: &str,
        event: DomainEvent,
        priority: i64,
    ) -> Result<(), QueueError> {
        self.queue.enqueue(discriminator, event, priority).await?;
        self.new_item.notify_waiters();
        Ok(())
    }

    pub async fn is_queued(&self, discriminator: &str, event: &DomainEvent) -> Result<bool, QueueError> {
        self.queue.is_queued(discriminator, &event.item_key()).await
    }

    pub async fn try_lease(&self) -> Result<Option<LeasedDomainEvent>, QueueError> {
        self.queue.lease().await
    }

    /// Wait until an item can be leased.
    ///
    /// Cancel-safe up to the lease itself: dropping the future while it waits
    /// leaves the queue untouched.
    pub async fn await_item(&self) -> Result<LeasedDomainEvent, QueueError> {
        loop {
            let notified = self.new_item.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(leased) = self.queue.lease().await? {
                debug!(
                    discriminator = %leased.lease.discriminator,
                    revision = leased.item.revision(),
                    "leased domain event"
                );
                return Ok(leased);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    pub async fn renew_lock(&self, discriminator: &str, token: LeaseToken) -> Result<(), QueueError> {
        self.queue.renew_lock(discriminator, token).await
    }

    /// Acknowledge the leased head and record consumer progress.
    ///
    /// A failure to record progress is logged, not returned: the item is
    /// already gone from the queue and at worst gets re-delivered by recovery.
    pub async fn acknowledge(
        &self,
        discriminator: &str,
        token: LeaseToken,
    ) -> Result<DomainEvent, QueueError> {
        let event = self.queue.acknowledge(discriminator, token).await?;
        self.new_item.notify_waiters();

        if let Err(err) = self
            .progress
            .record_progress(discriminator, event.aggregate_id(), event.revision())
            .await
        {
            warn!(
                discriminator,
                aggregate_id = %event.aggregate_id(),
                revision = event.revision(),
                error = %err,
                "failed to record consumer progress"
            );
        }

        debug!(
            discriminator,
            aggregate_id = %event.aggregate_id(),
            revision = event.revision(),
            "acknowledged domain event"
        );
        Ok(event)
    }

    pub async fn defer(
        &self,
        discriminator: &str,
        token: LeaseToken,
        priority: i64,
    ) -> Result<(), QueueError> {
        self.queue.defer(discriminator, token, priority).await?;
        self.new_item.notify_waiters();
        Ok(())
    }

    pub async fn release_lock(&self, discriminator: &str, token: LeaseToken) -> Result<(), QueueError> {
        self.queue.release_lock(discriminator, token).await?;
        self.new_item.notify_waiters();
        Ok(())
    }

    /// Drop expired leases and wake consumers for the freed lanes.
    pub async fn sweep_expired_locks(&self) -> Result<Vec<LockLease>, QueueError> {
        let expired = self.queue.sweep_expired_locks().await?;
        if !expired.is_empty() {
            self.new_item.notify_waiters();
        }
        Ok(expired)
    }

    /// Heartbeat-framed wait for the next item.
    ///
    /// Yields a heartbeat immediately and every `heartbeat_interval` while
    /// waiting, then exactly one item, then ends. If the consumer goes away
    /// after the lease was taken but before the item was handed over, the
    /// lease is released so the lane does not stall until expiry. Once the
    /// item sits in the hand-off buffer it counts as delivered; a disconnect
    /// after that point leaves the lease to expire.
    pub fn stream_next_item(
        self: &Arc<Self>,
        heartbeat_interval: Duration,
    ) -> ReceiverStream<Result<Frame<LeasedDomainEvent>, QueueError>> {
        let dispatcher = Arc::clone(self);
        let (tx, rx) = mpsc::channel(HANDOFF_BUFFER);

        tokio::spawn(async move {
            if tx.send(Ok(Frame::Heartbeat)).await.is_err() {
                return;
            }

            let mut ticker =
                tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let waiting = dispatcher.await_item();
            tokio::pin!(waiting);

            loop {
                tokio::select! {
                    biased;

                    _ = tx.closed() => {
                        debug!("consumer went away while waiting for an item");
                        return;
                    }
                    leased = &mut waiting => {
                        match leased {
                            Ok(leased) => {
                                if let Err(mpsc::error::SendError(Ok(Frame::Item(leased)))) =
                                    tx.send(Ok(Frame::Item(leased))).await
                                {
                                    dispatcher.release_abandoned(leased).await;
                                }
                            }
                            Err(err) => {
                                let _ = tx.send(Err(err)).await;
                            }
                        }
                        return;
                    }
                    _ = ticker.tick() => {
                        if tx.send(Ok(Frame::Heartbeat)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        ReceiverStream::new(rx)
    }

    async fn release_abandoned(&self, leased: LeasedDomainEvent) {
        let LockLease {
            discriminator,
            token,
            ..
        } = leased.lease;

        match self.release_lock(&discriminator, token).await {
            Ok(()) => info!(
                discriminator = %discriminator,
                revision = leased.item.revision(),
                "consumer disconnected before delivery; lease released"
            ),
            Err(err) => warn!(
                discriminator = %discriminator,
                error = %err,
                "failed to release abandoned lease; it will expire"
            ),
        }
    }
}
