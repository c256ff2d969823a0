//! Wires the order, inventory and payment services to one in-process bus.
//!
//! Each service owns its tables and outbox. A publisher per service moves
//! outbox records onto the bus and a consumer per topic feeds the owning
//! service's router:
//!
//! ```text
//! order outbox ──► inventory.requests ──► InventoryService
//!              └─► payment.requests   ──► PaymentService
//! inventory/payment outboxes ──► order.replies ──► SagaCoordinator
//! ```

use std::sync::Arc;
use std::time::Duration;

use common::Clock;
use contracts::{EventType, INVENTORY_REQUESTS, ORDER_REPLIES, PAYMENT_REQUESTS};
use inventory::{InventoryDatabase, InventoryService, InventoryState};
use messaging::{
    EventConsumer, EventProducer, InMemoryDatabase, InMemoryEventBus, OutboxPublisher,
    OutboxStatus, OutboxTables, PeriodicTask, RetentionSweep,
};
use order::{CatalogPort, OrderDatabase, OrderService, OrderState, SagaCoordinator, SagaRecovery};
use payment::{PaymentDatabase, PaymentGateway, PaymentService, PaymentState};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::Result;

/// Rounds [`FulfillmentSystem::pump`] runs before giving up on quiescence.
const MAX_PUMP_ROUNDS: usize = 64;

/// External collaborators the services depend on.
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogPort>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub clock: Arc<dyn Clock>,
}

/// Handles to every service, shared with the HTTP layer.
#[derive(Clone)]
pub struct Services {
    pub orders: Arc<OrderService>,
    pub coordinator: Arc<SagaCoordinator>,
    pub recovery: Arc<SagaRecovery>,
    pub retention: Arc<RetentionSweep>,
    pub inventory: Arc<InventoryService>,
    pub payment: Arc<PaymentService>,
}

/// Outbox records per status, for one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxBacklog {
    pub pending: usize,
    pub retry_scheduled: usize,
    pub dead: usize,
}

impl Services {
    /// Outbox backlog of the order, inventory and payment services.
    pub async fn outbox_backlog(&self) -> [(&'static str, OutboxBacklog); 3] {
        [
            ("order", backlog(self.orders.database()).await),
            ("inventory", backlog(self.inventory.database()).await),
            ("payment", backlog(self.payment.database()).await),
        ]
    }
}

async fn backlog<T>(db: &InMemoryDatabase<T>) -> OutboxBacklog
where
    T: OutboxTables + Clone + Send + Sync,
{
    db.read(|state| {
        let outbox = state.outbox();
        OutboxBacklog {
            pending: outbox.count_by_status(OutboxStatus::Pending),
            retry_scheduled: outbox.count_by_status(OutboxStatus::RetryScheduled),
            dead: outbox.count_by_status(OutboxStatus::Dead),
        }
    })
    .await
}

/// What one [`FulfillmentSystem::pump`] call moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub rounds: usize,
    pub published: usize,
    pub handled: usize,
    pub dropped: usize,
}

/// The assembled, not yet running, system.
pub struct FulfillmentSystem {
    pub services: Services,
    pub bus: InMemoryEventBus,
    publishers: Vec<(&'static str, Arc<OutboxPublisher<EventType>>)>,
    consumers: Vec<EventConsumer<EventType>>,
    poll_interval: Duration,
    recovery_interval: Duration,
    retention_interval: Duration,
}

impl FulfillmentSystem {
    /// Builds every service with in-memory storage and subscribes the
    /// consumers. Nothing runs until [`start`](Self::start) or
    /// [`pump`](Self::pump).
    pub async fn build(config: &Config, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            catalog,
            gateway,
            clock,
        } = collaborators;

        let order_db = OrderDatabase::new(OrderState::default());
        let order_config = config.order_service();
        let conflict_retries = order_config.conflict_retries;
        let orders = Arc::new(OrderService::new(
            order_db.clone(),
            catalog,
            Arc::clone(&clock),
            order_config,
        ));
        let coordinator = Arc::new(SagaCoordinator::new(
            order_db.clone(),
            Arc::clone(&clock),
            conflict_retries,
        ));
        let recovery = Arc::new(SagaRecovery::new(Arc::clone(&orders)));

        let inventory_db = InventoryDatabase::new(InventoryState::default());
        let inventory = Arc::new(InventoryService::new(inventory_db.clone(), Arc::clone(&clock)));

        let payment_db = PaymentDatabase::new(PaymentState::default());
        let payment = Arc::new(PaymentService::new(
            payment_db.clone(),
            gateway,
            Arc::clone(&clock),
        ));

        let retention = Arc::new(
            RetentionSweep::new(Arc::clone(&clock), config.retention)
                .with_outbox("order", Arc::new(order_db.clone()))
                .with_inbox("order", Arc::new(order_db.clone()))
                .with_outbox("inventory", Arc::new(inventory_db.clone()))
                .with_inbox("inventory", Arc::new(inventory_db.clone()))
                .with_outbox("payment", Arc::new(payment_db.clone()))
                .with_inbox("payment", Arc::new(payment_db.clone())),
        );

        let bus = InMemoryEventBus::new();
        let producer: Arc<dyn EventProducer> = Arc::new(bus.clone());
        let publishers = vec![
            (
                "order-outbox",
                Arc::new(OutboxPublisher::new(
                    Arc::new(order_db),
                    Arc::clone(&producer),
                    OrderService::converters()?,
                    Arc::clone(&clock),
                    config.publisher("order"),
                )),
            ),
            (
                "inventory-outbox",
                Arc::new(OutboxPublisher::new(
                    Arc::new(inventory_db),
                    Arc::clone(&producer),
                    InventoryService::converters()?,
                    Arc::clone(&clock),
                    config.publisher("inventory"),
                )),
            ),
            (
                "payment-outbox",
                Arc::new(OutboxPublisher::new(
                    Arc::new(payment_db),
                    producer,
                    PaymentService::converters()?,
                    Arc::clone(&clock),
                    config.publisher("payment"),
                )),
            ),
        ];

        let retry = config.retry_policy();
        let consumers = vec![
            EventConsumer::new(
                "inventory",
                bus.subscribe(INVENTORY_REQUESTS).await,
                Arc::new(inventory.router()?),
                retry,
            ),
            EventConsumer::new(
                "payment",
                bus.subscribe(PAYMENT_REQUESTS).await,
                Arc::new(payment.router()?),
                retry,
            ),
            EventConsumer::new(
                "order",
                bus.subscribe(ORDER_REPLIES).await,
                Arc::new(coordinator.router()?),
                retry,
            ),
        ];

        Ok(Self {
            services: Services {
                orders,
                coordinator,
                recovery,
                retention,
                inventory,
                payment,
            },
            bus,
            publishers,
            consumers,
            poll_interval: config.outbox_poll_interval,
            recovery_interval: config.saga_recovery_interval,
            retention_interval: config.retention_interval,
        })
    }

    /// Publishes and consumes until nothing moves.
    ///
    /// Deterministic stand-in for the background tasks, used by tests.
    pub async fn pump(&mut self) -> Result<PumpReport> {
        let mut report = PumpReport::default();
        while report.rounds < MAX_PUMP_ROUNDS {
            report.rounds += 1;
            let mut moved = 0;
            for (_, publisher) in &self.publishers {
                let published = publisher.drain().await?.published;
                report.published += published;
                moved += published;
            }
            for consumer in &mut self.consumers {
                let consumed = consumer.poll_once().await;
                report.handled += consumed.handled;
                report.dropped += consumed.dropped;
                moved += consumed.handled + consumed.failed + consumed.dropped;
            }
            if moved == 0 {
                break;
            }
        }
        Ok(report)
    }

    /// Starts publishers and the recovery and retention sweeps on timers and
    /// every consumer on its own task.
    pub fn start(self) -> RunningSystem {
        let mut tasks = Vec::with_capacity(self.publishers.len() + 2);
        for (name, publisher) in self.publishers {
            tasks.push(PeriodicTask::start(name, self.poll_interval, move || {
                let publisher = Arc::clone(&publisher);
                async move {
                    if let Err(error) = publisher.run_once().await {
                        tracing::error!(%error, "outbox publisher run failed");
                    }
                }
            }));
        }

        let recovery = Arc::clone(&self.services.recovery);
        tasks.push(PeriodicTask::start(
            "saga-recovery",
            self.recovery_interval,
            move || {
                let recovery = Arc::clone(&recovery);
                async move {
                    if let Err(error) = recovery.sweep().await {
                        tracing::error!(%error, "saga recovery sweep failed");
                    }
                }
            },
        ));

        let retention = Arc::clone(&self.services.retention);
        tasks.push(PeriodicTask::start(
            "outbox-retention",
            self.retention_interval,
            move || {
                let retention = Arc::clone(&retention);
                async move {
                    if let Err(error) = retention.sweep().await {
                        tracing::error!(%error, "retention sweep failed");
                    }
                }
            },
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumers = self
            .consumers
            .into_iter()
            .map(|consumer| tokio::spawn(consumer.run(shutdown_rx.clone())))
            .collect();

        RunningSystem {
            services: self.services,
            bus: self.bus,
            tasks,
            consumers,
            shutdown_tx,
        }
    }
}

/// The system with its background tasks running.
pub struct RunningSystem {
    pub services: Services,
    pub bus: InMemoryEventBus,
    tasks: Vec<PeriodicTask>,
    consumers: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl RunningSystem {
    /// Stops the timers, letting in-flight ticks finish, then the consumers.
    pub async fn shutdown(self) {
        for task in self.tasks {
            let name = task.name();
            let ticks = task.stop().await;
            tracing::debug!(task = name, ticks, "stopped");
        }
        let _ = self.shutdown_tx.send(true);
        for consumer in self.consumers {
            if let Err(error) = consumer.await {
                tracing::error!(%error, "consumer task panicked");
            }
        }
        tracing::info!("fulfillment system stopped");
    }
}
