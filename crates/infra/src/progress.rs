//! Consumer progress persistence.
//!
//! Tracks, per (discriminator, aggregate), a contiguous watermark: every
//! revision at or below it was either acknowledged or is not routed to the
//! discriminator. Acknowledgements that arrive above the watermark are kept
//! individually until the gap below them closes. The recovery loop walks each
//! aggregate from the watermark upwards to find events whose enqueue was lost.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

use aeon_core::AggregateId;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("storage error: {0}")]
    Storage(String),
}

/// Progress of one discriminator over one aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerProgress {
    /// Every revision `<= watermark` is settled.
    pub watermark: u64,
    /// Acknowledged revisions above the watermark.
    pub acknowledged: BTreeSet<u64>,
}

impl ConsumerProgress {
    pub fn is_settled(&self, revision: u64) -> bool {
        revision <= self.watermark || self.acknowledged.contains(&revision)
    }

    /// Mark `revision` acknowledged. Returns `false` if it already was.
    pub fn acknowledge(&mut self, revision: u64) -> bool {
        if self.is_settled(revision) {
            return false;
        }
        self.acknowledged.insert(revision);
        self.absorb();
        true
    }

    /// Move the watermark up to `revision` (never down).
    pub fn advance_to(&mut self, revision: u64) {
        if revision <= self.watermark {
            return;
        }
        self.watermark = revision;
        self.acknowledged = self.acknowledged.split_off(&(revision + 1));
        self.absorb();
    }

    fn absorb(&mut self) {
        while self.acknowledged.remove(&(self.watermark + 1)) {
            self.watermark += 1;
        }
    }
}

#[async_trait]
pub trait ConsumerProgressStore: Send + Sync {
    async fn setup(&self) -> Result<(), ProgressError> {
        Ok(())
    }

    /// Current progress; the default (watermark 0) if nothing was recorded.
    async fn get_progress(
        &self,
        discriminator: &str,
        aggregate_id: AggregateId,
    ) -> Result<ConsumerProgress, ProgressError>;

    /// Record an acknowledged revision.
    async fn record_progress(
        &self,
        discriminator: &str,
        aggregate_id: AggregateId,
        revision: u64,
    ) -> Result<(), ProgressError>;

    /// Mark every revision up to `revision` as settled.
    async fn advance_watermark(
        &self,
        discriminator: &str,
        aggregate_id: AggregateId,
        revision: u64,
    ) -> Result<(), ProgressError>;
}

#[derive(Debug, Default)]
pub struct InMemoryConsumerProgressStore {
    progress: RwLock<HashMap<(String, AggregateId), ConsumerProgress>>,
}

impl InMemoryConsumerProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(
        &self,
        discriminator: &str,
        aggregate_id: AggregateId,
        f: impl FnOnce(&mut ConsumerProgress),
    ) -> Result<(), ProgressError> {
        let mut progress = self
            .progress
            .write()
            .map_err(|_| ProgressError::Storage("lock poisoned".to_string()))?;
        f(progress
            .entry((discriminator.to_string(), aggregate_id))
            .or_default());
        Ok(())
    }
}

#[async_trait]
impl ConsumerProgressStore for InMemoryConsumerProgressStore {
    async fn get_progress(
        &self,
        discriminator: &str,
        aggregate_id: AggregateId,
    ) -> Result<ConsumerProgress, ProgressError> {
        let progress = self
            .progress
            .read()
            .map_err(|_| ProgressError::Storage("lock poisoned".to_string()))?;
        Ok(progress
            .get(&(discriminator.to_string(), aggregate_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn record_progress(
        &self,
        discriminator: &str,
        aggregate_id: AggregateId,
        revision: u64,
    ) -> Result<(), ProgressError> {
        self.update(discriminator, aggregate_id, |p| {
            p.acknowledge(revision);
        })
    }

    async fn advance_watermark(
        &self,
        discriminator: &str,
        aggregate_id: AggregateId,
        revision: u64,
    ) -> Result<(), ProgressError> {
        self.update(discriminator, aggregate_id, |p| p.advance_to(revision))
    }
}

/// Postgres-backed consumer progress.
///
/// Updates read the row `FOR UPDATE`, apply the change in memory and write it
/// back in the same transaction.
pub struct PostgresConsumerProgressStore {
    pool: Arc<PgPool>,
}

impl PostgresConsumerProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn update(
        &self,
        discriminator: &str,
        aggregate_id: AggregateId,
        f: impl FnOnce(&mut ConsumerProgress) + Send,
    ) -> Result<(), ProgressError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ProgressError::Storage(format!("begin: {e}")))?;

        // Make sure a row exists so FOR UPDATE has something to lock.
        sqlx::query(
            r#"
            INSERT INTO consumer_progress (discriminator, aggregate_id, revision, acknowledged)
            VALUES ($1, $2, 0, '{}')
            ON CONFLICT (discriminator, aggregate_id) DO NOTHING
            "#,
        )
        .bind(discriminator)
        .bind(aggregate_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| ProgressError::Storage(format!("insert progress: {e}")))?;

        let (watermark, acknowledged): (i64, Vec<i64>) = sqlx::query_as(
            r#"
            SELECT revision, acknowledged
            FROM consumer_progress
            WHERE discriminator = $1 AND aggregate_id = $2
            FOR UPDATE
            "#,
        )
        .bind(discriminator)
        .bind(aggregate_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| ProgressError::Storage(format!("lock progress: {e}")))?;

        let mut progress = from_row(watermark, acknowledged);
        f(&mut progress);
        let acknowledged: Vec<i64> = progress.acknowledged.iter().map(|r| *r as i64).collect();

        sqlx::query(
            r#"
            UPDATE consumer_progress
            SET revision = $3, acknowledged = $4, updated_at = NOW()
            WHERE discriminator = $1 AND aggregate_id = $2
            "#,
        )
        .bind(discriminator)
        .bind(aggregate_id.as_uuid())
        .bind(progress.watermark as i64)
        .bind(acknowledged)
        .execute(&mut *tx)
        .await
        .map_err(|e| ProgressError::Storage(format!("update progress: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| ProgressError::Storage(format!("commit: {e}")))?;
        Ok(())
    }
}

fn from_row(watermark: i64, acknowledged: Vec<i64>) -> ConsumerProgress {
    ConsumerProgress {
        watermark: watermark as u64,
        acknowledged: acknowledged.into_iter().map(|r| r as u64).collect(),
    }
}

#[async_trait]
impl ConsumerProgressStore for PostgresConsumerProgressStore {
    async fn setup(&self) -> Result<(), ProgressError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS consumer_progress (
                discriminator TEXT NOT NULL,
                aggregate_id UUID NOT NULL,
                revision BIGINT NOT NULL,
                acknowledged BIGINT[] NOT NULL DEFAULT '{}',
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (discriminator, aggregate_id)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| ProgressError::Storage(format!("setup: {e}")))?;
        Ok(())
    }

    async fn get_progress(
        &self,
        discriminator: &str,
        aggregate_id: AggregateId,
    ) -> Result<ConsumerProgress, ProgressError> {
        let row: Option<(i64, Vec<i64>)> = sqlx::query_as(
            r#"
            SELECT revision, acknowledged
            FROM consumer_progress
            WHERE discriminator = $1 AND aggregate_id = $2
            "#,
        )
        .bind(discriminator)
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| ProgressError::Storage(format!("get_progress: {e}")))?;

        Ok(row
            .map(|(watermark, acknowledged)| from_row(watermark, acknowledged))
            .unwrap_or_default())
    }

    async fn record_progress(
        &self,
        discriminator: &str,
        aggregate_id: AggregateId,
        revision: u64,
    ) -> Result<(), ProgressError> {
        self.update(discriminator, aggregate_id, move |p| {
            p.acknowledge(revision);
        })
        .await
    }

    async fn advance_watermark(
        &self,
        discriminator: &str,
        aggregate_id: AggregateId,
        revision: u64,
    ) -> Result<(), ProgressError> {
        self.update(discriminator, aggregate_id, move |p| p.advance_to(revision))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_order_acknowledgements_move_the_watermark() {
        let store = InMemoryConsumerProgressStore::new();
        let id = AggregateId::new();

        assert_eq!(store.get_progress("flow", id).await.unwrap().watermark, 0);
        store.record_progress("flow", id, 1).await.unwrap();
        store.record_progress("flow", id, 2).await.unwrap();
        store.record_progress("flow", id, 1).await.unwrap();

        let progress = store.get_progress("flow", id).await.unwrap();
        assert_eq!(progress.watermark, 2);
        assert!(progress.acknowledged.is_empty());
        assert_eq!(store.get_progress("other", id).await.unwrap(), ConsumerProgress::default());
    }

    #[tokio::test]
    async fn out_of_order_acknowledgement_waits_for_the_gap() {
        let store = InMemoryConsumerProgressStore::new();
        let id = AggregateId::new();

        store.record_progress("flow", id, 1).await.unwrap();
        store.record_progress("flow", id, 3).await.unwrap();

        let progress = store.get_progress("flow", id).await.unwrap();
        assert_eq!(progress.watermark, 1);
        assert!(!progress.is_settled(2));
        assert!(progress.is_settled(3));

        store.record_progress("flow", id, 2).await.unwrap();
        let progress = store.get_progress("flow", id).await.unwrap();
        assert_eq!(progress.watermark, 3);
        assert!(progress.acknowledged.is_empty());
    }

    #[test]
    fn advancing_absorbs_acknowledgements_above() {
        let mut progress = ConsumerProgress::default();
        progress.acknowledge(3);
        progress.acknowledge(5);
        progress.advance_to(2);
        assert_eq!(progress.watermark, 3);
        assert_eq!(progress.acknowledged, BTreeSet::from([5]));

        progress.advance_to(1);
        assert_eq!(progress.watermark, 3);

        progress.advance_to(6);
        assert_eq!(progress.watermark, 6);
        assert!(progress.acknowledged.is_empty());
    }
}
