use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use aeon_core::{DomainEvent, ErrorCode, LeaseToken, LockLease};

/// Something that can be queued.
///
/// `item_key` identifies the item inside one discriminator lane; enqueueing a
/// second item with the same key into the same lane is rejected.
pub trait QueueItem: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    fn item_key(&self) -> String;
}

impl QueueItem for DomainEvent {
    fn item_key(&self) -> String {
        self.id.to_string()
    }
}

/// Head entry of a lane, handed out together with its lease.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedItem<T> {
    pub item: T,
    pub priority: i64,
    pub lease: LockLease,
}

/// Priority queue operation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("item '{item_key}' is already queued for discriminator '{discriminator}'")]
    ItemAlreadyQueued {
        discriminator: String,
        item_key: String,
    },

    #[error("no item found for discriminator '{0}'")]
    ItemNotFound(String),

    #[error("item for discriminator '{0}' is not locked")]
    ItemNotLocked(String),

    #[error("token mismatch for discriminator '{0}'")]
    TokenMismatch(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl QueueError {
    pub fn code(&self) -> ErrorCode {
        match self {
            QueueError::ItemAlreadyQueued { .. } => ErrorCode::ItemAlreadyQueued,
            QueueError::ItemNotFound(_) => ErrorCode::ItemNotFound,
            QueueError::ItemNotLocked(_) => ErrorCode::ItemNotLocked,
            QueueError::TokenMismatch(_) => ErrorCode::TokenMismatch,
            QueueError::Storage(_) => ErrorCode::UnknownError,
        }
    }
}

/// Lease-based priority queue partitioned by discriminator.
///
/// ## Ordering
///
/// Each discriminator owns a FIFO lane. `lease()` considers only the head of
/// every lane that has no live lease and hands out the one with the lowest
/// `(priority, enqueue order)`.
///
/// ## Leases
///
/// - At most one live lease per discriminator at any time.
/// - A lease expires `expiration_time` after grant or last renewal; an expired
///   lease is treated as absent and its head becomes leasable again.
/// - Only the holder of the current token can renew, release, acknowledge,
///   or defer.
///
/// ## Failure Precedence
///
/// For token-checked operations: unknown discriminator → `ItemNotFound`,
/// no live lease → `ItemNotLocked`, wrong token → `TokenMismatch`.
#[async_trait]
pub trait PriorityQueueStore<T: QueueItem>: Send + Sync {
    async fn setup(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn destroy(&self) -> Result<(), QueueError> {
        Ok(())
    }

    /// Append `item` to the tail of `discriminator`'s lane.
    async fn enqueue(&self, discriminator: &str, item: T, priority: i64) -> Result<(), QueueError>;

    /// Lease the best eligible lane head, or `None` if nothing is eligible.
    async fn lease(&self) -> Result<Option<LeasedItem<T>>, QueueError>;

    /// Push out the expiry of a live lease. The token stays the same.
    async fn renew_lock(&self, discriminator: &str, token: LeaseToken) -> Result<(), QueueError>;

    /// Drop a live lease without touching the lane; the head stays first in line.
    async fn release_lock(&self, discriminator: &str, token: LeaseToken) -> Result<(), QueueError>;

    /// Remove the leased head and release the lane.
    async fn acknowledge(&self, discriminator: &str, token: LeaseToken) -> Result<T, QueueError>;

    /// Move the leased head to the lane tail with a new priority and release the lane.
    async fn defer(
        &self,
        discriminator: &str,
        token: LeaseToken,
        priority: i64,
    ) -> Result<(), QueueError>;

    /// Drop every expired lease, returning what was dropped.
    async fn sweep_expired_locks(&self) -> Result<Vec<LockLease>, QueueError>;

    /// Whether an item with `item_key` is waiting (or leased) in `discriminator`'s lane.
    async fn is_queued(&self, discriminator: &str, item_key: &str) -> Result<bool, QueueError>;
}

#[async_trait]
impl<T, S> PriorityQueueStore<T> for Arc<S>
where
    T: QueueItem,
    S: PriorityQueueStore<T> + ?Sized,
{
    async fn setup(&self) -> Result<(), QueueError> {
        (**self).setup().await
    }

    async fn destroy(&self) -> Result<(), QueueError> {
        (**self).destroy().await
    }

    async fn enqueue(&self, discriminator: &str, item: T, priority: i64) -> Result<(), QueueError> {
        (**self).enqueue(discriminator, item, priority).await
    }

    async fn lease(&self) -> Result<Option<LeasedItem<T>>, QueueError> {
        (**self).lease().await
    }

    async fn renew_lock(&self, discriminator: &str, token: LeaseToken) -> Result<(), QueueError> {
        (**self).renew_lock(discriminator, token).await
    }

    async fn release_lock(&self, discriminator: &str, token: LeaseToken) -> Result<(), QueueError> {
        (**self).release_lock(discriminator, token).await
    }

    async fn acknowledge(&self, discriminator: &str, token: LeaseToken) -> Result<T, QueueError> {
        (**self).acknowledge(discriminator, token).await
    }

    async fn defer(
        &self,
        discriminator: &str,
        token: LeaseToken,
        priority: i64,
    ) -> Result<(), QueueError> {
        (**self).defer(discriminator, token, priority).await
    }

    async fn sweep_expired_locks(&self) -> Result<Vec<LockLease>, QueueError> {
        (**self).sweep_expired_locks().await
    }

    async fn is_queued(&self, discriminator: &str, item_key: &str) -> Result<bool, QueueError> {
        (**self).is_queued(discriminator, item_key).await
    }
}
