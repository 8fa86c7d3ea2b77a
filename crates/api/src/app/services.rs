//! Store, queue and background-loop wiring shared by all routes.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use aeon_core::DomainEvent;
use aeon_infra::config::{ConfigError, RuntimeConfig};
use aeon_infra::dispatcher::{Dispatcher, DispatcherConfig};
use aeon_infra::domain_event_store::{
    DomainEventStore, DomainEventStoreError, EnqueueingDomainEventStore, InMemoryDomainEventStore,
    PostgresDomainEventStore,
};
use aeon_infra::priority_queue::{
    InMemoryPriorityQueueStore, PostgresPriorityQueueStore, PriorityQueueStore, QueueError,
};
use aeon_infra::progress::{
    ConsumerProgressStore, InMemoryConsumerProgressStore, PostgresConsumerProgressStore,
    ProgressError,
};
use aeon_infra::recovery::RecoveryLoop;
use aeon_infra::replay::ReplayCoordinator;

#[derive(Debug, Error)]
pub enum ServicesError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to connect to Postgres: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("domain event store setup failed: {0}")]
    Store(#[from] DomainEventStoreError),

    #[error("priority queue setup failed: {0}")]
    Queue(#[from] QueueError),

    #[error("progress store setup failed: {0}")]
    Progress(#[from] ProgressError),
}

pub struct AppServices {
    /// Write path: appends, then enqueues for owning flows.
    pub domain_event_store: Arc<dyn DomainEventStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub replay: Arc<ReplayCoordinator>,
    pub recovery: Arc<RecoveryLoop>,
    pub heartbeat_interval: Duration,
}

/// Build services from config: Postgres when `use_persistent_stores`, else in-memory.
pub async fn build_services(config: &RuntimeConfig) -> Result<AppServices, ServicesError> {
    if config.use_persistent_stores {
        return build_persistent_services(config).await;
    }
    Ok(build_in_memory_services(config))
}

/// In-memory wiring (dev/test).
pub fn build_in_memory_services(config: &RuntimeConfig) -> AppServices {
    info!("using in-memory stores");
    wire(
        config,
        Arc::new(InMemoryDomainEventStore::new()),
        Arc::new(InMemoryPriorityQueueStore::<DomainEvent>::new(config.expiration_time)),
        Arc::new(InMemoryConsumerProgressStore::new()),
    )
}

async fn build_persistent_services(config: &RuntimeConfig) -> Result<AppServices, ServicesError> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or(ConfigError::Missing("DATABASE_URL"))?;

    let pool = PgPool::connect(database_url).await?;

    let store = PostgresDomainEventStore::new(pool.clone());
    store.setup().await?;

    let queue = PostgresPriorityQueueStore::<DomainEvent>::new(pool.clone(), config.expiration_time);
    queue.setup().await?;

    let progress = PostgresConsumerProgressStore::new(pool);
    progress.setup().await?;

    info!("using Postgres stores");
    Ok(wire(config, Arc::new(store), Arc::new(queue), Arc::new(progress)))
}

fn wire(
    config: &RuntimeConfig,
    store: Arc<dyn DomainEventStore>,
    queue: Arc<dyn PriorityQueueStore<DomainEvent>>,
    progress: Arc<dyn ConsumerProgressStore>,
) -> AppServices {
    let flows = Arc::new(config.flows.clone());
    let dispatcher = Arc::new(Dispatcher::new(
        queue,
        progress.clone(),
        DispatcherConfig {
            poll_interval: config.queue_poll_interval,
        },
    ));

    let replay = Arc::new(ReplayCoordinator::new(
        store.clone(),
        dispatcher.clone(),
        flows.clone(),
    ));
    let recovery = Arc::new(RecoveryLoop::new(
        store.clone(),
        dispatcher.clone(),
        progress,
        flows.clone(),
    ));
    let domain_event_store: Arc<dyn DomainEventStore> = Arc::new(EnqueueingDomainEventStore::new(
        store,
        dispatcher.clone(),
        flows,
    ));

    AppServices {
        domain_event_store,
        dispatcher,
        replay,
        recovery,
        heartbeat_interval: config.heartbeat_interval,
    }
}
