//! Process wiring: the bus, the ledger, the stores and every consumer group.

use std::sync::Arc;
use std::time::Duration;

use event_bus::{
    ConsumerGroup, EventBus, InMemoryEventBus, PostgresEventBus, RetryPolicy, Shutdown, TopicSpec,
};
use inventory::{InventoryLedger, LedgerConfig, LedgerSnapshotStore, PostgresLedgerSnapshotStore};
use orders::{
    InMemoryOrderRepository, InMemoryProductCatalog, OrderRepository, OrderStatusProjector,
    PROJECTOR_CHANNELS, PROJECTOR_GROUP, PostgresOrderRepository,
};
use saga::{
    COMPENSATION_CHANNELS, COMPENSATION_GROUP, COORDINATOR_CHANNELS, COORDINATOR_GROUP,
    CheckResultHandler, CompensationHandler, InMemorySagaStateStore, OrderValidatedHandler,
    PAYMENT_CHANNELS, PAYMENT_GROUP, PaymentFailedHandler, PaymentProcessor,
    PostgresSagaStateStore, SagaCoordinator, SagaStateStore,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::StartupError;

pub type Bus = Arc<dyn EventBus>;

pub type Coordinator = SagaCoordinator<
    Arc<dyn OrderRepository>,
    Arc<InMemoryProductCatalog>,
    Arc<dyn SagaStateStore>,
    Bus,
>;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub orders: Arc<dyn OrderRepository>,
    pub catalog: Arc<InMemoryProductCatalog>,
    pub ledger: Arc<InventoryLedger<Bus>>,
    pub payments: Arc<PaymentProcessor<Bus>>,
}

/// Persistence chosen at startup.
///
/// With a database the bus log, the ledger snapshots, the orders and the
/// sagas all live in PostgreSQL; otherwise everything stays in memory.
#[derive(Clone)]
pub struct Stores {
    pub orders: Arc<dyn OrderRepository>,
    pub sagas: Arc<dyn SagaStateStore>,
    pub snapshots: Option<Arc<dyn LedgerSnapshotStore>>,
    pub database: Option<PgPool>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            orders: Arc::new(InMemoryOrderRepository::new()),
            sagas: Arc::new(InMemorySagaStateStore::new()),
            snapshots: None,
            database: None,
        }
    }

    /// Connects to PostgreSQL and applies the migrations.
    pub async fn postgres(url: &str) -> Result<Self, StartupError> {
        let pool = PgPoolOptions::new().max_connections(20).connect(url).await?;
        let orders = PostgresOrderRepository::new(pool.clone());
        orders.run_migrations().await?;

        Ok(Self {
            orders: Arc::new(orders),
            sagas: Arc::new(PostgresSagaStateStore::new(pool.clone())),
            snapshots: Some(Arc::new(PostgresLedgerSnapshotStore::new(pool.clone()))),
            database: Some(pool),
        })
    }

    /// Opens the event bus matching these stores.
    pub async fn bus(&self, partitions: u32) -> Result<Bus, StartupError> {
        let topics = TopicSpec::all(partitions);
        Ok(match &self.database {
            Some(pool) => Arc::new(PostgresEventBus::connect(pool.clone(), topics).await?),
            None => Arc::new(InMemoryEventBus::new(topics)),
        })
    }

    pub async fn from_config(config: &Config) -> Result<Self, StartupError> {
        match &config.database_url {
            Some(url) => {
                tracing::info!("using PostgreSQL stores");
                Self::postgres(url).await
            }
            None => {
                tracing::info!("using in-memory stores");
                Ok(Self::in_memory())
            }
        }
    }
}

/// Running workers plus the state the HTTP layer reads.
pub struct Runtime {
    state: Arc<AppState>,
    shutdown: Shutdown,
    groups: Vec<ConsumerGroup>,
    sweeper: JoinHandle<()>,
}

impl Runtime {
    /// Starts the ledger, the coordinator, the projector, the payment
    /// processor, the compensation handler and the expired-saga sweeper.
    #[tracing::instrument(skip_all, fields(partitions = config.bus_partitions))]
    pub async fn start(config: &Config, stores: Stores) -> Result<Self, StartupError> {
        let bus = stores.bus(config.bus_partitions).await?;
        let shutdown = Shutdown::new();
        let retry = RetryPolicy::default();

        let ledger_config = LedgerConfig {
            retry: retry.clone(),
            snapshot_every: config.snapshot_every,
            ..LedgerConfig::default()
        };
        let ledger = Arc::new(match stores.snapshots.clone() {
            Some(snapshots) => {
                InventoryLedger::start_with_snapshots(
                    bus.clone(),
                    ledger_config,
                    snapshots,
                    shutdown.subscribe(),
                )
                .await?
            }
            None => InventoryLedger::start(bus.clone(), ledger_config, shutdown.subscribe()).await?,
        });

        let catalog = Arc::new(InMemoryProductCatalog::new());
        let coordinator = Arc::new(
            SagaCoordinator::new(
                stores.orders.clone(),
                catalog.clone(),
                stores.sagas.clone(),
                bus.clone(),
            )
            .with_ttl(config.saga_ttl),
        );
        let payments = Arc::new(PaymentProcessor::new(bus.clone(), config.payment_mode));

        let groups = vec![
            ConsumerGroup::spawn(
                bus.clone(),
                COORDINATOR_GROUP,
                &COORDINATOR_CHANNELS,
                Arc::new(CheckResultHandler::new(coordinator.clone())),
                retry.clone(),
                shutdown.subscribe(),
            )?,
            ConsumerGroup::spawn(
                bus.clone(),
                PROJECTOR_GROUP,
                &PROJECTOR_CHANNELS,
                Arc::new(OrderStatusProjector::new(stores.orders.clone())),
                retry.clone(),
                shutdown.subscribe(),
            )?,
            ConsumerGroup::spawn(
                bus.clone(),
                PAYMENT_GROUP,
                &PAYMENT_CHANNELS,
                Arc::new(OrderValidatedHandler::new(payments.clone())),
                retry.clone(),
                shutdown.subscribe(),
            )?,
            ConsumerGroup::spawn(
                bus.clone(),
                COMPENSATION_GROUP,
                &COMPENSATION_CHANNELS,
                Arc::new(PaymentFailedHandler::new(CompensationHandler::new(
                    stores.orders.clone(),
                    bus,
                ))),
                retry,
                shutdown.subscribe(),
            )?,
        ];

        let sweeper = tokio::spawn(purge_expired_sagas(
            stores.sagas.clone(),
            config.purge_interval,
            shutdown.subscribe(),
        ));

        let state = Arc::new(AppState {
            coordinator,
            orders: stores.orders,
            catalog,
            ledger,
            payments,
        });

        tracing::info!(groups = groups.len(), "workers started");
        Ok(Self {
            state,
            shutdown,
            groups,
            sweeper,
        })
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Signals every worker and waits for them to finish.
    pub async fn stop(self) {
        self.shutdown.trigger();
        for group in self.groups {
            group.join().await;
        }
        self.state.ledger.join().await;
        if let Err(e) = self.sweeper.await {
            tracing::error!(error = %e, "saga sweeper panicked");
        }
        tracing::info!("workers stopped");
    }
}

/// Periodically drops sagas whose TTL has passed.
async fn purge_expired_sagas(
    store: Arc<dyn SagaStateStore>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    while !*shutdown.borrow() {
        tokio::select! {
            _ = ticker.tick() => match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => {
                    metrics::counter!("saga_expired_purged_total").increment(purged);
                    tracing::info!(purged, "expired sagas purged");
                }
                Err(e) => tracing::warn!(error = %e, "saga purge failed"),
            },
            stopped = shutdown.changed() => {
                if stopped.is_err() {
                    break;
                }
            }
        }
    }
}
