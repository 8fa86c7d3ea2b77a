//! Postgres-backed priority queue.
//!
//! ## Schema
//!
//! - `queue_items`: one row per entry. `sequence BIGSERIAL` is the FIFO order
//!   inside a lane (a deferred head draws a fresh sequence, moving it to the
//!   tail). `UNIQUE (discriminator, item_key)` rejects duplicates.
//! - `queue_locks`: at most one row per discriminator (primary key), holding
//!   the current token, expiry and the `sequence` of the leased entry.
//!
//! ## Lease Race
//!
//! `lease()` picks a candidate head, then claims its lane inside a
//! transaction: a conditional upsert that only succeeds when no lock row
//! exists or the existing one has expired, followed by a re-read of the lane
//! head. The claim is committed only if the head is still the candidate, so
//! an entry acknowledged by another process between the two steps is never
//! handed out again. Losers retry with the next candidate.
//!
//! `acknowledge` and `defer` act on the locked `sequence`, never on whatever
//! happens to be the lane minimum at that moment.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use aeon_core::{LeaseToken, LockLease};

use super::r#trait::{LeasedItem, PriorityQueueStore, QueueError, QueueItem};
use crate::domain_event_store::postgres::is_unique_violation;

const LEASE_ATTEMPTS: usize = 3;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS queue_items (
        sequence BIGSERIAL PRIMARY KEY,
        discriminator TEXT NOT NULL,
        item_key TEXT NOT NULL,
        priority BIGINT NOT NULL,
        item JSONB NOT NULL,
        CONSTRAINT queue_items_discriminator_item_key UNIQUE (discriminator, item_key)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS queue_items_discriminator_sequence ON queue_items (discriminator, sequence)",
    r#"
    CREATE TABLE IF NOT EXISTS queue_locks (
        discriminator TEXT PRIMARY KEY,
        token UUID NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        sequence BIGINT NOT NULL
    )
    "#,
];

#[derive(Debug)]
pub struct PostgresPriorityQueueStore<T> {
    pool: Arc<PgPool>,
    expiration_time: Duration,
    _item: PhantomData<fn() -> T>,
}

impl<T> Clone for PostgresPriorityQueueStore<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            expiration_time: self.expiration_time,
            _item: PhantomData,
        }
    }
}

impl<T: QueueItem> PostgresPriorityQueueStore<T> {
    pub fn new(pool: PgPool, expiration_time: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            expiration_time,
            _item: PhantomData,
        }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, QueueError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    /// Lock and validate the live lease on `discriminator`, returning the
    /// sequence of the leased entry.
    async fn check_lock(
        tx: &mut Transaction<'static, Postgres>,
        discriminator: &str,
        token: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<i64, QueueError> {
        let lock = sqlx::query(
            "SELECT token, expires_at, sequence FROM queue_locks WHERE discriminator = $1 FOR UPDATE",
        )
        .bind(discriminator)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("check_lock", e))?;

        let live = match lock {
            Some(row) => {
                let lock = LockRow::from_row(&row).map_err(|e| {
                    QueueError::Storage(format!("failed to read lock row: {e}"))
                })?;
                (lock.expires_at > now).then_some(lock)
            }
            None => None,
        };

        match live {
            Some(current) if current.token == *token.as_uuid() => Ok(current.sequence),
            Some(_) => Err(QueueError::TokenMismatch(discriminator.to_string())),
            None => {
                let has_items: bool = sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM queue_items WHERE discriminator = $1)",
                )
                .bind(discriminator)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| map_sqlx_error("check_lock", e))?;

                if has_items {
                    Err(QueueError::ItemNotLocked(discriminator.to_string()))
                } else {
                    Err(QueueError::ItemNotFound(discriminator.to_string()))
                }
            }
        }
    }

    async fn delete_lock(
        tx: &mut Transaction<'static, Postgres>,
        discriminator: &str,
    ) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_locks WHERE discriminator = $1")
            .bind(discriminator)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("release_lock", e))?;
        Ok(())
    }

    /// Oldest entry of `discriminator`'s lane.
    async fn lane_head(
        tx: &mut Transaction<'static, Postgres>,
        discriminator: &str,
    ) -> Result<Option<HeadRow>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT sequence, discriminator, priority, item
            FROM queue_items
            WHERE discriminator = $1
            ORDER BY sequence ASC
            LIMIT 1
            "#,
        )
        .bind(discriminator)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lane_head", e))?;

        row.map(|row| HeadRow::from_row(&row))
            .transpose()
            .map_err(|e| QueueError::Storage(format!("failed to read queue row: {e}")))
    }

    /// Best head across unlocked lanes, read without taking any lock.
    async fn lease_candidate(&self, now: DateTime<Utc>) -> Result<Option<HeadRow>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT q.sequence, q.discriminator, q.priority, q.item
            FROM queue_items q
            WHERE q.sequence = (
                SELECT MIN(h.sequence) FROM queue_items h
                WHERE h.discriminator = q.discriminator
            )
            AND NOT EXISTS (
                SELECT 1 FROM queue_locks l
                WHERE l.discriminator = q.discriminator AND l.expires_at > $1
            )
            ORDER BY q.priority ASC, q.sequence ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("lease_candidate", e))?;

        row.map(|row| HeadRow::from_row(&row))
            .transpose()
            .map_err(|e| QueueError::Storage(format!("failed to read queue row: {e}")))
    }

    /// Claim the lane of `candidate`. `None` if another lease is live or the
    /// lane head is no longer `candidate`.
    async fn claim(
        &self,
        candidate: &HeadRow,
        now: DateTime<Utc>,
    ) -> Result<Option<LockLease>, QueueError> {
        let mut tx = self.begin().await?;
        let lease = LockLease::grant(candidate.discriminator.as_str(), now, self.expiration_time);

        let claimed = sqlx::query(
            r#"
            INSERT INTO queue_locks (discriminator, token, expires_at, sequence)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (discriminator) DO UPDATE
            SET token = EXCLUDED.token,
                expires_at = EXCLUDED.expires_at,
                sequence = EXCLUDED.sequence
            WHERE queue_locks.expires_at <= $5
            RETURNING discriminator
            "#,
        )
        .bind(&candidate.discriminator)
        .bind(lease.token.as_uuid())
        .bind(lease.expires_at)
        .bind(candidate.sequence)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lease_claim", e))?;

        if claimed.is_none() {
            return Ok(None);
        }

        let head = Self::lane_head(&mut tx, &candidate.discriminator).await?;
        if head.map(|h| h.sequence) != Some(candidate.sequence) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(Some(lease))
    }

    fn decode(item: JsonValue) -> Result<T, QueueError> {
        serde_json::from_value(item)
            .map_err(|e| QueueError::Storage(format!("failed to decode queued item: {e}")))
    }
}

#[async_trait]
impl<T: QueueItem> PriorityQueueStore<T> for PostgresPriorityQueueStore<T> {
    #[instrument(skip(self), err)]
    async fn setup(&self) -> Result<(), QueueError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("setup", e))?;
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), QueueError> {
        self.pool.close().await;
        Ok(())
    }

    #[instrument(skip(self, item), err)]
    async fn enqueue(&self, discriminator: &str, item: T, priority: i64) -> Result<(), QueueError> {
        let item_key = item.item_key();
        let payload = serde_json::to_value(&item)
            .map_err(|e| QueueError::Storage(format!("failed to encode queued item: {e}")))?;

        let result = sqlx::query(
            r#"
            INSERT INTO queue_items (discriminator, item_key, priority, item)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(discriminator)
        .bind(&item_key)
        .bind(priority)
        .bind(payload)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if is_unique_violation(db_err.code().as_deref()) => {
                Err(QueueError::ItemAlreadyQueued {
                    discriminator: discriminator.to_string(),
                    item_key,
                })
            }
            Err(e) => Err(map_sqlx_error("enqueue", e)),
        }
    }

    async fn lease(&self) -> Result<Option<LeasedItem<T>>, QueueError> {
        for attempt in 0..LEASE_ATTEMPTS {
            let now = Utc::now();

            let Some(head) = self.lease_candidate(now).await? else {
                return Ok(None);
            };

            if let Some(lease) = self.claim(&head, now).await? {
                return Ok(Some(LeasedItem {
                    item: Self::decode(head.item)?,
                    priority: head.priority,
                    lease,
                }));
            }

            debug!(
                discriminator = %head.discriminator,
                attempt,
                "lost lease race; retrying"
            );
        }

        Ok(None)
    }

    #[instrument(skip(self), err)]
    async fn renew_lock(&self, discriminator: &str, token: LeaseToken) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut tx = self.begin().await?;
        Self::check_lock(&mut tx, discriminator, token, now).await?;

        let mut renewed = LockLease {
            discriminator: discriminator.to_string(),
            token,
            expires_at: now,
        };
        renewed.renew(now, self.expiration_time);

        sqlx::query("UPDATE queue_locks SET expires_at = $2 WHERE discriminator = $1")
            .bind(discriminator)
            .bind(renewed.expires_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("renew_lock", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    #[instrument(skip(self), err)]
    async fn release_lock(&self, discriminator: &str, token: LeaseToken) -> Result<(), QueueError> {
        let mut tx = self.begin().await?;
        Self::check_lock(&mut tx, discriminator, token, Utc::now()).await?;
        Self::delete_lock(&mut tx, discriminator).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    #[instrument(skip(self), err)]
    async fn acknowledge(&self, discriminator: &str, token: LeaseToken) -> Result<T, QueueError> {
        let now = Utc::now();
        let mut tx = self.begin().await?;
        let sequence = Self::check_lock(&mut tx, discriminator, token, now).await?;

        let item: Option<JsonValue> = sqlx::query_scalar(
            r#"
            DELETE FROM queue_items
            WHERE discriminator = $1 AND sequence = $2
            RETURNING item
            "#,
        )
        .bind(discriminator)
        .bind(sequence)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("acknowledge", e))?;

        let Some(item) = item else {
            return Err(QueueError::ItemNotFound(discriminator.to_string()));
        };

        Self::delete_lock(&mut tx, discriminator).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        Self::decode(item)
    }

    #[instrument(skip(self), err)]
    async fn defer(
        &self,
        discriminator: &str,
        token: LeaseToken,
        priority: i64,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut tx = self.begin().await?;
        let sequence = Self::check_lock(&mut tx, discriminator, token, now).await?;

        let moved = sqlx::query(
            r#"
            UPDATE queue_items
            SET priority = $3,
                sequence = nextval(pg_get_serial_sequence('queue_items', 'sequence'))
            WHERE discriminator = $1 AND sequence = $2
            "#,
        )
        .bind(discriminator)
        .bind(sequence)
        .bind(priority)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("defer", e))?;

        if moved.rows_affected() == 0 {
            return Err(QueueError::ItemNotFound(discriminator.to_string()));
        }

        Self::delete_lock(&mut tx, discriminator).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))
    }

    async fn sweep_expired_locks(&self) -> Result<Vec<LockLease>, QueueError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM queue_locks
            WHERE expires_at <= $1
            RETURNING discriminator, token, expires_at, sequence
            "#,
        )
        .bind(Utc::now())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("sweep_expired_locks", e))?;

        rows.iter()
            .map(|row| {
                let discriminator: String = row
                    .try_get("discriminator")
                    .map_err(|e| QueueError::Storage(format!("failed to read lock row: {e}")))?;
                let lock = LockRow::from_row(row)
                    .map_err(|e| QueueError::Storage(format!("failed to read lock row: {e}")))?;
                Ok(LockLease {
                    discriminator,
                    token: LeaseToken::from_uuid(lock.token),
                    expires_at: lock.expires_at,
                })
            })
            .collect()
    }

    async fn is_queued(&self, discriminator: &str, item_key: &str) -> Result<bool, QueueError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM queue_items WHERE discriminator = $1 AND item_key = $2)",
        )
        .bind(discriminator)
        .bind(item_key)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("is_queued", e))
    }
}

struct HeadRow {
    sequence: i64,
    discriminator: String,
    priority: i64,
    item: JsonValue,
}

impl<'r> FromRow<'r, PgRow> for HeadRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            sequence: row.try_get("sequence")?,
            discriminator: row.try_get("discriminator")?,
            priority: row.try_get("priority")?,
            item: row.try_get("item")?,
        })
    }
}

struct LockRow {
    token: Uuid,
    expires_at: DateTime<Utc>,
    sequence: i64,
}

impl<'r> FromRow<'r, PgRow> for LockRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            token: row.try_get("token")?,
            expires_at: row.try_get("expires_at")?,
            sequence: row.try_get("sequence")?,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            QueueError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            QueueError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => QueueError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aeon_core::{AggregateId, AggregateIdentifier, ContextIdentifier, DomainEvent};

    /// Connects to `AEON_TEST_DATABASE_URL`; tests are skipped when it is unset.
    async fn store() -> Option<PostgresPriorityQueueStore<DomainEvent>> {
        let url = std::env::var("AEON_TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.unwrap();
        let store = PostgresPriorityQueueStore::new(pool, Duration::from_secs(60));
        store.setup().await.unwrap();
        Some(store)
    }

    fn event(id: AggregateId, revision: u64) -> DomainEvent {
        DomainEvent::new(
            ContextIdentifier::new("sampleContext"),
            AggregateIdentifier::new("sampleAggregate", id),
            "executed",
            serde_json::json!({}),
            revision,
        )
    }

    async fn head_of(store: &PostgresPriorityQueueStore<DomainEvent>, lane: &str) -> HeadRow {
        let mut tx = store.begin().await.unwrap();
        PostgresPriorityQueueStore::<DomainEvent>::lane_head(&mut tx, lane)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn stale_candidate_is_not_claimed_after_its_entry_was_acknowledged() {
        let Some(store) = store().await else {
            return;
        };
        let lane = format!("lane-{}", Uuid::new_v4());
        let id = AggregateId::new();
        store.enqueue(&lane, event(id, 1), 0).await.unwrap();
        store.enqueue(&lane, event(id, 2), 0).await.unwrap();

        // One process reads the head, another leases and acknowledges it.
        let stale = head_of(&store, &lane).await;
        let other = head_of(&store, &lane).await;
        let lease = store.claim(&other, Utc::now()).await.unwrap().unwrap();
        let acknowledged = store.acknowledge(&lane, lease.token).await.unwrap();
        assert_eq!(acknowledged.revision(), 1);

        assert!(store.claim(&stale, Utc::now()).await.unwrap().is_none());

        let head = head_of(&store, &lane).await;
        let lease = store.claim(&head, Utc::now()).await.unwrap().unwrap();
        let acknowledged = store.acknowledge(&lane, lease.token).await.unwrap();
        assert_eq!(acknowledged.revision(), 2);
    }
}
