//! Order commands and queries.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use common::{Clock, Currency, Money, OrderId, UserId};
use contracts::{EventType, InventoryReserveRequested, RequestedItem, emit};
use messaging::{
    ConverterRegistry, InMemoryDatabase, InboxTable, InboxTables, MessagingError, OutboxTable,
    OutboxTables, Table, retry_on_conflict,
};

use crate::catalog::CatalogPort;
use crate::command::PlaceOrder;
use crate::error::{OrderError, Result};
use crate::order::{ORDER_KEY, Order, OrderItem, OrderStatus};
use crate::saga::{SAGA_ORDER_KEY, Saga};

/// Event types the order service writes to its outbox.
pub const EMITTED: [EventType; 6] = [
    EventType::InventoryReserveRequested,
    EventType::InventoryReleaseRequested,
    EventType::InventoryCommitRequested,
    EventType::PaymentRequested,
    EventType::PaymentCommitRequested,
    EventType::PaymentReleaseRequested,
];

/// All order tables, committed together.
#[derive(Debug, Clone, Default)]
pub struct OrderState {
    pub orders: Table<Order>,
    pub sagas: Table<Saga>,
    pub outbox: OutboxTable,
    pub inbox: InboxTable,
}

impl OutboxTables for OrderState {
    fn outbox(&self) -> &OutboxTable {
        &self.outbox
    }

    fn outbox_mut(&mut self) -> &mut OutboxTable {
        &mut self.outbox
    }
}

impl InboxTables for OrderState {
    fn inbox(&self) -> &InboxTable {
        &self.inbox
    }

    fn inbox_mut(&mut self) -> &mut InboxTable {
        &mut self.inbox
    }
}

pub type OrderDatabase = InMemoryDatabase<OrderState>;

impl OrderState {
    pub fn order_by_key(&self, user_id: UserId, idempotency_key: &str) -> Option<&Order> {
        self.orders
            .find_unique(ORDER_KEY, &Order::key_for(user_id, idempotency_key))
    }

    pub fn saga_for(&self, order_id: OrderId) -> Option<&Saga> {
        self.sagas.find_unique(SAGA_ORDER_KEY, &order_id.to_string())
    }

    pub(crate) fn load_order(&self, order_id: OrderId) -> Result<Order> {
        self.orders
            .get(&order_id)
            .cloned()
            .ok_or(OrderError::OrderNotFound(order_id))
    }

    pub(crate) fn load_saga(&self, order_id: OrderId) -> Result<Saga> {
        self.saga_for(order_id)
            .cloned()
            .ok_or(OrderError::SagaNotFound(order_id))
    }

    /// Creates the saga in `INVENTORY_REQUESTED` and moves the order to
    /// `PAYING`. Returns false if the saga already exists.
    pub(crate) fn bootstrap_saga(&mut self, order_id: OrderId, now: DateTime<Utc>) -> Result<bool> {
        if self.saga_for(order_id).is_some() {
            return Ok(false);
        }
        let mut order = self.load_order(order_id)?;

        let mut saga = Saga::create(order_id, now);
        saga.mark_inventory_requested(now)?;
        self.sagas.insert(saga)?;

        if order.status() == OrderStatus::Created {
            order.mark_paying(now)?;
            self.orders.update(order)?;
        }
        Ok(true)
    }
}

/// Tunables of the order service.
#[derive(Debug, Clone)]
pub struct OrderServiceConfig {
    /// Upper bound on the saga bootstrap transaction.
    pub bootstrap_timeout: Duration,
    /// Default page size of [`OrderService::get_orders`].
    pub page_size: u32,
    /// Attempts made when a write hits a version conflict.
    pub conflict_retries: u32,
    /// Age after which an order without a saga is considered stalled.
    pub recovery_grace: Duration,
}

impl Default for OrderServiceConfig {
    fn default() -> Self {
        Self {
            bootstrap_timeout: Duration::from_secs(3),
            page_size: 20,
            conflict_retries: 3,
            recovery_grace: Duration::from_secs(60),
        }
    }
}

impl OrderServiceConfig {
    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries.max(1);
        self
    }

    pub fn with_recovery_grace(mut self, grace: Duration) -> Self {
        self.recovery_grace = grace;
        self
    }
}

/// One row of a user's order list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSummary {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub item_count: usize,
    pub total_amount: Money,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for OrderSummary {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id(),
            status: order.status(),
            item_count: order.items().len(),
            total_amount: order.total_amount(),
            currency: order.currency().clone(),
            created_at: order.created_at(),
        }
    }
}

/// A zero-based page of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn has_next(&self) -> bool {
        (self.page as usize + 1) * (self.page_size as usize) < self.total
    }
}

/// Places orders and starts their sagas.
pub struct OrderService {
    db: OrderDatabase,
    catalog: Arc<dyn CatalogPort>,
    clock: Arc<dyn Clock>,
    config: OrderServiceConfig,
}

impl OrderService {
    pub fn new(
        db: OrderDatabase,
        catalog: Arc<dyn CatalogPort>,
        clock: Arc<dyn Clock>,
        config: OrderServiceConfig,
    ) -> Self {
        Self {
            db,
            catalog,
            clock,
            config,
        }
    }

    pub fn database(&self) -> &OrderDatabase {
        &self.db
    }

    pub fn config(&self) -> &OrderServiceConfig {
        &self.config
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Converters for everything the order side emits.
    pub fn converters() -> messaging::Result<ConverterRegistry<EventType>> {
        contracts::converters(EMITTED)
    }

    /// Places an order, or returns the order already placed under the same
    /// user and idempotency key.
    ///
    /// The order and its reservation request commit together. The saga is
    /// created in a second, time-boxed transaction; if that one fails the
    /// order still stands and the recovery sweep finishes the bootstrap.
    #[tracing::instrument(skip(self, command), fields(user_id = %command.user_id, idempotency_key = %command.idempotency_key))]
    pub async fn place_order(&self, command: PlaceOrder) -> Result<OrderId> {
        command.validate().map_err(OrderError::InvalidCommand)?;

        let user_id = command.user_id;
        let existing = self
            .db
            .read(|state| state.order_by_key(user_id, &command.idempotency_key).map(Order::id))
            .await;
        if let Some(order_id) = existing {
            tracing::debug!(%order_id, "order already placed");
            return Ok(order_id);
        }

        let items = self.priced_items(&command).await?;
        let now = self.clock.now();
        let order = Order::place(
            user_id,
            command.idempotency_key.clone(),
            items,
            command.currency.clone(),
            now,
        )?;
        if order.total_amount() != command.total_amount {
            return Err(OrderError::InvalidCommand(format!(
                "total amount {} does not match computed total {}",
                command.total_amount,
                order.total_amount()
            )));
        }

        let order_id = order.id();
        let placed = self
            .db
            .transaction(|state| -> Result<bool> {
                let order = match state.orders.insert(order) {
                    Ok(order) => order,
                    Err(MessagingError::UniqueViolation { constraint, .. })
                        if constraint == ORDER_KEY =>
                    {
                        return Ok(false);
                    }
                    Err(e) => return Err(e.into()),
                };
                let request = InventoryReserveRequested {
                    order_id,
                    items: order
                        .items()
                        .iter()
                        .map(|item| RequestedItem {
                            product_id: item.product_id.clone(),
                            quantity: item.quantity,
                        })
                        .collect(),
                };
                emit(state, order_id, &request, now)?;
                Ok(true)
            })
            .await?;

        if !placed {
            let winner = self
                .db
                .read(|state| state.order_by_key(user_id, &command.idempotency_key).map(Order::id))
                .await
                .ok_or(OrderError::OrderNotFound(order_id))?;
            tracing::debug!(order_id = %winner, "lost race to a concurrent placement");
            return Ok(winner);
        }

        match tokio::time::timeout(self.config.bootstrap_timeout, self.bootstrap_saga(order_id)).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                tracing::warn!(%order_id, %error, "saga bootstrap failed, left to recovery");
            }
            Err(_) => {
                let error = OrderError::BootstrapTimeout(order_id);
                tracing::warn!(%order_id, %error, "saga bootstrap timed out, left to recovery");
            }
        }

        tracing::info!(%order_id, total = %command.total_amount, "order placed");
        metrics::counter!("orders_placed_total").increment(1);
        Ok(order_id)
    }

    /// Creates the saga of a placed order. Returns false if it already exists.
    pub async fn bootstrap_saga(&self, order_id: OrderId) -> Result<bool> {
        retry_on_conflict(self.config.conflict_retries, move || async move {
            let now = self.clock.now();
            self.db
                .transaction(|state| state.bootstrap_saga(order_id, now))
                .await
        })
        .await
    }

    /// A user's orders, newest first.
    pub async fn get_orders(&self, user_id: UserId, page: u32) -> Page<OrderSummary> {
        let page_size = self.config.page_size;
        self.db
            .read(|state| {
                let mut orders: Vec<&Order> = state
                    .orders
                    .values()
                    .filter(|order| order.user_id() == user_id)
                    .collect();
                orders.sort_by(|a, b| {
                    b.created_at()
                        .cmp(&a.created_at())
                        .then_with(|| a.id().cmp(&b.id()))
                });
                let total = orders.len();
                let items = orders
                    .into_iter()
                    .skip(page as usize * page_size as usize)
                    .take(page_size as usize)
                    .map(OrderSummary::from)
                    .collect();
                Page {
                    items,
                    page,
                    page_size,
                    total,
                }
            })
            .await
    }

    pub async fn order(&self, order_id: OrderId) -> Option<Order> {
        self.db.read(|state| state.orders.get(&order_id).cloned()).await
    }

    pub async fn saga(&self, order_id: OrderId) -> Option<Saga> {
        self.db.read(|state| state.saga_for(order_id).cloned()).await
    }

    /// Looks up current prices and checks they are all in the order currency.
    async fn priced_items(&self, command: &PlaceOrder) -> Result<Vec<OrderItem>> {
        let product_ids: Vec<_> = command
            .items
            .iter()
            .map(|line| line.product_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let prices: HashMap<_, _> = self
            .catalog
            .price_snapshots(&product_ids)
            .await?
            .into_iter()
            .map(|snapshot| (snapshot.product_id.clone(), snapshot))
            .collect();

        command
            .items
            .iter()
            .map(|line| {
                let snapshot = prices.get(&line.product_id).ok_or_else(|| {
                    OrderError::InvalidCommand(format!("unknown product {}", line.product_id))
                })?;
                if snapshot.currency != command.currency {
                    return Err(OrderError::InvalidCommand(format!(
                        "{} is priced in {}, order is in {}",
                        line.product_id, snapshot.currency, command.currency
                    )));
                }
                Ok(OrderItem {
                    product_id: line.product_id.clone(),
                    quantity: line.quantity,
                    unit_price: snapshot.price,
                })
            })
            .collect()
    }
}
