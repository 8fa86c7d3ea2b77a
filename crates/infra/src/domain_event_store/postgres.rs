//! Postgres-backed domain event store.
//!
//! ## Schema
//!
//! - `domain_events`: one row per event, `position BIGSERIAL` gives storage
//!   order, `UNIQUE (aggregate_id, revision)` is the final guard against
//!   concurrent appends.
//! - `snapshots`: keyed by `(aggregate_id, revision)`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | DomainEventStoreError |
//! |------------|----------------------|-----------------------|
//! | Database (unique violation) | `23505` | `RevisionAlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Other | N/A | `Storage` |
//!
//! ## Streaming
//!
//! Reads use keyset pagination (`position > $last`, or `revision > $last` for
//! aggregate replays) in pages of `PAGE_SIZE`, so a cursor never holds a
//! connection between pages.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use aeon_core::{AggregateId, AggregateIdentifier, DomainEvent, Snapshot};

use super::r#trait::{
    AggregateIdentifierStream, DomainEventStore, DomainEventStoreError, DomainEventStream,
    RevisionRange, check_batch_revisions,
};

const PAGE_SIZE: i64 = 100;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS domain_events (
        position BIGSERIAL PRIMARY KEY,
        aggregate_id UUID NOT NULL,
        aggregate_name TEXT NOT NULL,
        revision BIGINT NOT NULL CHECK (revision >= 1),
        causation_id UUID NOT NULL,
        correlation_id UUID NOT NULL,
        timestamp BIGINT NOT NULL,
        domain_event JSONB NOT NULL,
        CONSTRAINT domain_events_aggregate_revision UNIQUE (aggregate_id, revision)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS domain_events_causation_id ON domain_events (causation_id)",
    "CREATE INDEX IF NOT EXISTS domain_events_correlation_id ON domain_events (correlation_id)",
    "CREATE INDEX IF NOT EXISTS domain_events_timestamp ON domain_events (timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        aggregate_id UUID NOT NULL,
        aggregate_name TEXT NOT NULL,
        revision BIGINT NOT NULL CHECK (revision >= 1),
        state JSONB NOT NULL,
        PRIMARY KEY (aggregate_id, revision)
    )
    "#,
];

/// Postgres-backed append-only domain event store.
///
/// ## Concurrency
///
/// `store_domain_events()` runs in one transaction:
/// 1. Read `MAX(revision)` for every aggregate in the batch
/// 2. Check contiguity against those revisions
/// 3. Insert all rows
///
/// If another transaction commits in between, the unique constraint fails the
/// insert and the whole batch is rejected with `RevisionAlreadyExists`.
#[derive(Debug, Clone)]
pub struct PostgresDomainEventStore {
    pool: Arc<PgPool>,
}

impl PostgresDomainEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Lazily page through `domain_events` using `filter`.
    fn paged(&self, filter: PageFilter) -> DomainEventStream {
        let state = PageState {
            pool: self.pool.clone(),
            after: filter.initial_key(),
            filter,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            if state.buffer.is_empty() && !state.exhausted {
                if let Err(err) = state.fetch_page().await {
                    return Some((Err(err), None));
                }
            }
            let event = state.buffer.pop_front()?;
            Some((Ok(event), Some(state)))
        })
        .boxed()
    }
}

#[derive(Debug, Clone)]
enum PageFilter {
    FromTimestamp(i64),
    Aggregate { aggregate_id: Uuid, range: RevisionRange },
    Causation(Uuid),
    Correlation(Uuid),
}

impl PageFilter {
    fn initial_key(&self) -> i64 {
        match self {
            PageFilter::Aggregate { range, .. } => range.from_revision() as i64 - 1,
            _ => 0,
        }
    }
}

struct PageState {
    pool: Arc<PgPool>,
    filter: PageFilter,
    after: i64,
    buffer: VecDeque<DomainEvent>,
    exhausted: bool,
}

impl PageState {
    async fn fetch_page(&mut self) -> Result<(), DomainEventStoreError> {
        let rows = match &self.filter {
            PageFilter::FromTimestamp(from) => {
                sqlx::query(
                    r#"
                    SELECT position AS key, domain_event
                    FROM domain_events
                    WHERE position > $1 AND timestamp >= $2
                    ORDER BY position ASC
                    LIMIT $3
                    "#,
                )
                .bind(self.after)
                .bind(*from)
                .bind(PAGE_SIZE)
                .fetch_all(&*self.pool)
                .await
            }
            PageFilter::Aggregate {
                aggregate_id,
                range,
            } => {
                let to = range
                    .to_revision()
                    .map(|to| to as i64)
                    .unwrap_or(i64::MAX);
                sqlx::query(
                    r#"
                    SELECT revision AS key, domain_event
                    FROM domain_events
                    WHERE aggregate_id = $1 AND revision > $2 AND revision <= $3
                    ORDER BY revision ASC
                    LIMIT $4
                    "#,
                )
                .bind(aggregate_id)
                .bind(self.after)
                .bind(to)
                .bind(PAGE_SIZE)
                .fetch_all(&*self.pool)
                .await
            }
            PageFilter::Causation(causation_id) => {
                sqlx::query(
                    r#"
                    SELECT position AS key, domain_event
                    FROM domain_events
                    WHERE position > $1 AND causation_id = $2
                    ORDER BY position ASC
                    LIMIT $3
                    "#,
                )
                .bind(self.after)
                .bind(causation_id)
                .bind(PAGE_SIZE)
                .fetch_all(&*self.pool)
                .await
            }
            PageFilter::Correlation(correlation_id) => {
                sqlx::query(
                    r#"
                    SELECT position AS key, domain_event
                    FROM domain_events
                    WHERE position > $1 AND correlation_id = $2
                    ORDER BY position ASC
                    LIMIT $3
                    "#,
                )
                .bind(self.after)
                .bind(correlation_id)
                .bind(PAGE_SIZE)
                .fetch_all(&*self.pool)
                .await
            }
        }
        .map_err(|e| map_sqlx_error("fetch_page", e))?;

        if (rows.len() as i64) < PAGE_SIZE {
            self.exhausted = true;
        }

        for row in rows {
            let page_row = PageRow::from_row(&row).map_err(|e| {
                DomainEventStoreError::Storage(format!("failed to read event row: {e}"))
            })?;
            self.after = page_row.key;
            self.buffer.push_back(page_row.into_domain_event()?);
        }

        Ok(())
    }
}

struct PageRow {
    key: i64,
    domain_event: JsonValue,
}

impl<'r> FromRow<'r, PgRow> for PageRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            key: row.try_get("key")?,
            domain_event: row.try_get("domain_event")?,
        })
    }
}

impl PageRow {
    fn into_domain_event(self) -> Result<DomainEvent, DomainEventStoreError> {
        serde_json::from_value(self.domain_event).map_err(|e| {
            DomainEventStoreError::Storage(format!("failed to decode stored event: {e}"))
        })
    }
}

#[async_trait]
impl DomainEventStore for PostgresDomainEventStore {
    #[instrument(skip(self), err)]
    async fn setup(&self) -> Result<(), DomainEventStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("setup", e))?;
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), DomainEventStoreError> {
        self.pool.close().await;
        Ok(())
    }

    #[instrument(skip(self, events), fields(event_count = events.len()), err)]
    async fn store_domain_events(
        &self,
        events: Vec<DomainEvent>,
    ) -> Result<(), DomainEventStoreError> {
        // Structural checks first, so an invalid batch never opens a transaction.
        for event in &events {
            event.validate()?;
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut current: HashMap<AggregateId, u64> = HashMap::new();
        for event in &events {
            let aggregate_id = event.aggregate_id();
            if current.contains_key(&aggregate_id) {
                continue;
            }
            let revision: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(revision), 0) FROM domain_events WHERE aggregate_id = $1",
            )
            .bind(aggregate_id.as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("current_revision", e))?;
            current.insert(aggregate_id, revision as u64);
        }

        if let Err(err) = check_batch_revisions(&events, |id| current.get(&id).copied().unwrap_or(0))
        {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(err);
        }

        for event in &events {
            let payload = serde_json::to_value(event).map_err(|e| {
                DomainEventStoreError::Validation(format!("failed to encode domain event: {e}"))
            })?;

            sqlx::query(
                r#"
                INSERT INTO domain_events (
                    aggregate_id,
                    aggregate_name,
                    revision,
                    causation_id,
                    correlation_id,
                    timestamp,
                    domain_event
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(event.aggregate_id().as_uuid())
            .bind(&event.aggregate_identifier.name)
            .bind(event.revision() as i64)
            .bind(event.metadata.causation_id)
            .bind(event.metadata.correlation_id)
            .bind(event.metadata.timestamp)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_domain_event", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(())
    }

    async fn get_replay(
        &self,
        from_timestamp: Option<i64>,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        Ok(self.paged(PageFilter::FromTimestamp(from_timestamp.unwrap_or(0))))
    }

    async fn get_replay_for_aggregate(
        &self,
        aggregate_id: AggregateId,
        range: RevisionRange,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        Ok(self.paged(PageFilter::Aggregate {
            aggregate_id: *aggregate_id.as_uuid(),
            range,
        }))
    }

    #[instrument(
        skip(self),
        fields(aggregate_id = %aggregate_identifier.id, revision = tracing::field::Empty),
        err
    )]
    async fn get_last_domain_event(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> Result<DomainEvent, DomainEventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT revision AS key, domain_event
            FROM domain_events
            WHERE aggregate_id = $1
            ORDER BY revision DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_identifier.id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_last_domain_event", e))?;

        let Some(row) = row else {
            return Err(DomainEventStoreError::NotFound(format!(
                "no domain events for aggregate {}",
                aggregate_identifier.id
            )));
        };

        let page_row = PageRow::from_row(&row)
            .map_err(|e| DomainEventStoreError::Storage(format!("failed to read event row: {e}")))?;
        Span::current().record("revision", page_row.key);
        page_row.into_domain_event()
    }

    async fn get_domain_events_by_causation_id(
        &self,
        causation_id: Uuid,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        Ok(self.paged(PageFilter::Causation(causation_id)))
    }

    async fn get_domain_events_by_correlation_id(
        &self,
        correlation_id: Uuid,
    ) -> Result<DomainEventStream, DomainEventStoreError> {
        Ok(self.paged(PageFilter::Correlation(correlation_id)))
    }

    async fn has_domain_events_with_causation_id(
        &self,
        causation_id: Uuid,
    ) -> Result<bool, DomainEventStoreError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM domain_events WHERE causation_id = $1)")
            .bind(causation_id)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("has_domain_events_with_causation_id", e))
    }

    #[instrument(
        skip(self, snapshot),
        fields(aggregate_id = %snapshot.aggregate_identifier.id, revision = snapshot.revision),
        err
    )]
    async fn store_snapshot(&self, snapshot: Snapshot) -> Result<(), DomainEventStoreError> {
        snapshot.validate()?;

        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, aggregate_name, revision, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_id, revision)
            DO UPDATE SET state = EXCLUDED.state
            "#,
        )
        .bind(snapshot.aggregate_identifier.id.as_uuid())
        .bind(&snapshot.aggregate_identifier.name)
        .bind(snapshot.revision as i64)
        .bind(&snapshot.state)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("store_snapshot", e))?;

        Ok(())
    }

    async fn get_snapshot(
        &self,
        aggregate_identifier: &AggregateIdentifier,
    ) -> Result<Option<Snapshot>, DomainEventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_name, revision, state
            FROM snapshots
            WHERE aggregate_id = $1
            ORDER BY revision DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_identifier.id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_snapshot", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let snapshot_row = SnapshotRow::from_row(&row)
            .map_err(|e| DomainEventStoreError::Storage(format!("failed to read snapshot row: {e}")))?;

        Ok(Some(Snapshot::new(
            AggregateIdentifier::new(snapshot_row.aggregate_name, aggregate_identifier.id),
            snapshot_row.revision as u64,
            snapshot_row.state,
        )))
    }

    async fn get_aggregate_identifiers(
        &self,
    ) -> Result<AggregateIdentifierStream, DomainEventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT aggregate_id, aggregate_name, MIN(position) AS first_position
            FROM domain_events
            GROUP BY aggregate_id, aggregate_name
            ORDER BY first_position ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_aggregate_identifiers", e))?;

        let identifiers = rows
            .iter()
            .map(|row| {
                let id: Uuid = row.try_get("aggregate_id").map_err(|e| {
                    DomainEventStoreError::Storage(format!("failed to read aggregate row: {e}"))
                })?;
                let name: String = row.try_get("aggregate_name").map_err(|e| {
                    DomainEventStoreError::Storage(format!("failed to read aggregate row: {e}"))
                })?;
                Ok(AggregateIdentifier::new(name, AggregateId::from_uuid(id)))
            })
            .collect::<Vec<_>>();

        Ok(stream::iter(identifiers).boxed())
    }
}

struct SnapshotRow {
    aggregate_name: String,
    revision: i64,
    state: JsonValue,
}

impl<'r> FromRow<'r, PgRow> for SnapshotRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            aggregate_name: row.try_get("aggregate_name")?,
            revision: row.try_get("revision")?,
            state: row.try_get("state")?,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DomainEventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            if is_unique_violation(db_err.code().as_deref()) {
                DomainEventStoreError::RevisionAlreadyExists(msg)
            } else {
                DomainEventStoreError::Storage(msg)
            }
        }
        sqlx::Error::PoolClosed => {
            DomainEventStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => DomainEventStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

pub(crate) fn is_unique_violation(code: Option<&str>) -> bool {
    code == Some("23505")
}
