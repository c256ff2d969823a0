//! Inventory side of the fulfillment saga.
//!
//! Each inbound request is handled once per event id: the inbox guard records
//! the delivery, and the handler's transaction updates stock, writes the reply
//! to the outbox and marks the inbox record processed together.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use common::{Clock, InventoryId, OrderId, ProductId, ReservationId};
use contracts::{
    EventType, InventoryCommitRequested, InventoryCommitted, InventoryReleaseRequested,
    InventoryReleased, InventoryReservationFailed, InventoryReserveRequested, InventoryReserved,
    RequestedItem, emit,
};
use messaging::{
    ConverterRegistry, EventRouter, Handled, IdempotencyGuard, InMemoryDatabase, InboundEvent,
    InboxTable, InboxTables, OutboxTable, OutboxTables, Table, handler_fn,
};

use crate::error::{InventoryError, Result};
use crate::inventory::{Inventory, InventoryStatus, PRODUCT_KEY};
use crate::reservation::{ORDER_KEY, Reservation, ReservationItem, ReservationStatus};

/// Inbox scope of the inventory service.
pub const INBOX_SCOPE: &str = "inventory";

/// Event types the inventory service writes to its outbox.
pub const EMITTED: [EventType; 4] = [
    EventType::InventoryReserved,
    EventType::InventoryReservationFailed,
    EventType::InventoryReleased,
    EventType::InventoryCommitted,
];

/// Result of a reservation attempt. A rejection is a normal business outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationOutcome {
    Reserved(ReservationId),
    Rejected { reason: String },
}

/// All inventory tables, committed together.
#[derive(Debug, Clone, Default)]
pub struct InventoryState {
    pub inventories: Table<Inventory>,
    pub reservations: Table<Reservation>,
    pub outbox: OutboxTable,
    pub inbox: InboxTable,
}

impl OutboxTables for InventoryState {
    fn outbox(&self) -> &OutboxTable {
        &self.outbox
    }

    fn outbox_mut(&mut self) -> &mut OutboxTable {
        &mut self.outbox
    }
}

impl InboxTables for InventoryState {
    fn inbox(&self) -> &InboxTable {
        &self.inbox
    }

    fn inbox_mut(&mut self) -> &mut InboxTable {
        &mut self.inbox
    }
}

pub type InventoryDatabase = InMemoryDatabase<InventoryState>;

impl InventoryState {
    pub fn inventory_for(&self, product_id: &ProductId) -> Option<&Inventory> {
        self.inventories.find_unique(PRODUCT_KEY, product_id.as_str())
    }

    pub fn reservation_for(&self, order_id: OrderId) -> Option<&Reservation> {
        self.reservations
            .find_unique(ORDER_KEY, &Reservation::key_for(order_id))
    }

    /// Reserves every requested line or none of them.
    ///
    /// A second request for an order that already holds a reservation returns
    /// that reservation.
    pub fn reserve(
        &mut self,
        order_id: OrderId,
        items: &[RequestedItem],
        now: DateTime<Utc>,
    ) -> Result<ReservationOutcome> {
        if let Some(existing) = self.reservation_for(order_id) {
            return Ok(match existing.status() {
                ReservationStatus::Released => ReservationOutcome::Rejected {
                    reason: format!("reservation {} already released", existing.id()),
                },
                _ => ReservationOutcome::Reserved(existing.id()),
            });
        }
        if items.is_empty() {
            return Ok(rejected("no items requested"));
        }

        let mut wanted: BTreeMap<&ProductId, u32> = BTreeMap::new();
        for item in items {
            let quantity = wanted.entry(&item.product_id).or_default();
            let Some(total) = quantity.checked_add(item.quantity) else {
                return Ok(rejected(format!("quantity of {} is out of range", item.product_id)));
            };
            *quantity = total;
        }

        let mut staged = Vec::with_capacity(wanted.len());
        for (product_id, quantity) in wanted {
            let Some(inventory) = self.inventory_for(product_id) else {
                return Ok(rejected(format!("unknown product {product_id}")));
            };
            let mut inventory = inventory.clone();
            match inventory.reserve(quantity, now) {
                Ok(()) => staged.push((inventory, quantity)),
                Err(
                    e @ (InventoryError::InsufficientInventory { .. }
                    | InventoryError::InvalidQuantity { .. }
                    | InventoryError::InvalidTransition { .. }),
                ) => return Ok(rejected(e.to_string())),
                Err(e) => return Err(e),
            }
        }

        let lines = staged
            .iter()
            .map(|(inventory, quantity)| ReservationItem {
                inventory_id: inventory.id(),
                product_id: inventory.product_id().clone(),
                quantity: *quantity,
            })
            .collect();
        let reservation = Reservation::new(order_id, lines, now)?;
        for (inventory, _) in staged {
            self.inventories.update(inventory)?;
        }
        let reservation = self.reservations.insert(reservation)?;
        Ok(ReservationOutcome::Reserved(reservation.id()))
    }

    /// Releases the order's reservation.
    ///
    /// Returns `None` when the order never got a reservation. Releasing twice
    /// is a no-op that still returns the reservation id.
    pub fn release(&mut self, order_id: OrderId, now: DateTime<Utc>) -> Result<Option<ReservationId>> {
        let Some(reservation) = self.reservation_for(order_id) else {
            return Ok(None);
        };
        let mut reservation = reservation.clone();
        if reservation.status() == ReservationStatus::Released {
            return Ok(Some(reservation.id()));
        }

        let from = reservation.release(now)?;
        for item in reservation.items() {
            let mut inventory = self.inventories.load(&item.inventory_id)?;
            if from == ReservationStatus::Committed {
                inventory.increase(item.quantity, now)?;
            } else {
                inventory.release(item.quantity, now)?;
            }
            self.inventories.update(inventory)?;
        }
        let id = reservation.id();
        self.reservations.update(reservation)?;
        Ok(Some(id))
    }

    /// Confirms a reservation's stock as sold. Returns false if it already was.
    pub fn commit(&mut self, reservation_id: ReservationId, now: DateTime<Utc>) -> Result<bool> {
        let mut reservation = self
            .reservations
            .get(&reservation_id)
            .cloned()
            .ok_or(InventoryError::ReservationNotFound(reservation_id))?;
        if reservation.status() == ReservationStatus::Committed {
            return Ok(false);
        }

        reservation.commit(now)?;
        for item in reservation.items() {
            let mut inventory = self.inventories.load(&item.inventory_id)?;
            inventory.process_reserved(item.quantity, now)?;
            self.inventories.update(inventory)?;
        }
        self.reservations.update(reservation)?;
        Ok(true)
    }
}

fn rejected(reason: impl Into<String>) -> ReservationOutcome {
    ReservationOutcome::Rejected {
        reason: reason.into(),
    }
}

/// The inventory service.
pub struct InventoryService {
    db: InventoryDatabase,
    guard: IdempotencyGuard<InventoryDatabase>,
    clock: Arc<dyn Clock>,
}

impl InventoryService {
    pub fn new(db: InventoryDatabase, clock: Arc<dyn Clock>) -> Self {
        Self {
            guard: IdempotencyGuard::new(db.clone()),
            db,
            clock,
        }
    }

    pub fn database(&self) -> &InventoryDatabase {
        &self.db
    }

    /// Converters for everything this service emits.
    pub fn converters() -> messaging::Result<ConverterRegistry<EventType>> {
        contracts::converters(EMITTED)
    }

    /// Routes the `inventory.requests` topic to this service.
    pub fn router(self: &Arc<Self>) -> messaging::Result<EventRouter<EventType>> {
        let reserve = Arc::clone(self);
        let release = Arc::clone(self);
        let commit = Arc::clone(self);
        EventRouter::new([
            (
                EventType::InventoryReserveRequested,
                handler_fn(move |event| {
                    let service = Arc::clone(&reserve);
                    async move { service.on_reserve_requested(&event).await.map(drop) }
                }),
            ),
            (
                EventType::InventoryReleaseRequested,
                handler_fn(move |event| {
                    let service = Arc::clone(&release);
                    async move { service.on_release_requested(&event).await.map(drop) }
                }),
            ),
            (
                EventType::InventoryCommitRequested,
                handler_fn(move |event| {
                    let service = Arc::clone(&commit);
                    async move { service.on_commit_requested(&event).await.map(drop) }
                }),
            ),
        ])
    }

    /// Adds stock, creating the product's row on first use.
    #[tracing::instrument(skip(self))]
    pub async fn add_stock(&self, product_id: ProductId, quantity: u32) -> Result<InventoryId> {
        let now = self.clock.now();
        self.db
            .transaction(|state| -> Result<InventoryId> {
                match state.inventory_for(&product_id).cloned() {
                    Some(mut inventory) => {
                        inventory.increase(quantity, now)?;
                        Ok(state.inventories.update(inventory)?.id())
                    }
                    None => {
                        let inventory = Inventory::new(product_id.clone(), quantity, now);
                        Ok(state.inventories.insert(inventory)?.id())
                    }
                }
            })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_status(&self, product_id: ProductId, status: InventoryStatus) -> Result<()> {
        let now = self.clock.now();
        self.db
            .transaction(|state| -> Result<()> {
                let mut inventory = state
                    .inventory_for(&product_id)
                    .cloned()
                    .ok_or_else(|| InventoryError::UnknownProduct(product_id.clone()))?;
                inventory.change_status(status, now)?;
                state.inventories.update(inventory)?;
                Ok(())
            })
            .await
    }

    pub async fn inventory(&self, product_id: &ProductId) -> Option<Inventory> {
        self.db.read(|state| state.inventory_for(product_id).cloned()).await
    }

    pub async fn reservation(&self, order_id: OrderId) -> Option<Reservation> {
        self.db.read(|state| state.reservation_for(order_id).cloned()).await
    }

    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn on_reserve_requested(&self, event: &InboundEvent) -> Result<Handled> {
        let request: InventoryReserveRequested = event.decode()?;
        let now = self.clock.now();

        self.guard
            .handle(
                INBOX_SCOPE,
                &event.event_type,
                &event.event_id.to_string(),
                event.payload.clone(),
                self.clock.as_ref(),
                |inbox_id| {
                    self.db.transaction(move |state| -> Result<()> {
                        let order_id = request.order_id;
                        match state.reserve(order_id, &request.items, now)? {
                            ReservationOutcome::Reserved(reservation_id) => {
                                tracing::info!(%order_id, %reservation_id, "inventory reserved");
                                metrics::counter!("inventory_reservations_total", "outcome" => "reserved")
                                    .increment(1);
                                emit(
                                    state,
                                    order_id,
                                    &InventoryReserved {
                                        order_id,
                                        reservation_id,
                                    },
                                    now,
                                )?;
                            }
                            ReservationOutcome::Rejected { reason } => {
                                tracing::info!(%order_id, %reason, "reservation rejected");
                                metrics::counter!("inventory_reservations_total", "outcome" => "rejected")
                                    .increment(1);
                                emit(
                                    state,
                                    order_id,
                                    &InventoryReservationFailed { order_id, reason },
                                    now,
                                )?;
                            }
                        }
                        state.inbox.mark_processed(inbox_id, now)?;
                        Ok(())
                    })
                },
            )
            .await
    }

    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn on_release_requested(&self, event: &InboundEvent) -> Result<Handled> {
        let request: InventoryReleaseRequested = event.decode()?;
        let now = self.clock.now();

        self.guard
            .handle(
                INBOX_SCOPE,
                &event.event_type,
                &event.event_id.to_string(),
                event.payload.clone(),
                self.clock.as_ref(),
                |inbox_id| {
                    self.db.transaction(move |state| -> Result<()> {
                        let order_id = request.order_id;
                        let reservation_id = state.release(order_id, now)?;
                        tracing::info!(%order_id, ?reservation_id, reason = %request.reason, "inventory released");
                        emit(
                            state,
                            order_id,
                            &InventoryReleased {
                                order_id,
                                reservation_id,
                            },
                            now,
                        )?;
                        state.inbox.mark_processed(inbox_id, now)?;
                        Ok(())
                    })
                },
            )
            .await
    }

    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn on_commit_requested(&self, event: &InboundEvent) -> Result<Handled> {
        let request: InventoryCommitRequested = event.decode()?;
        let now = self.clock.now();

        self.guard
            .handle(
                INBOX_SCOPE,
                &event.event_type,
                &event.event_id.to_string(),
                event.payload.clone(),
                self.clock.as_ref(),
                |inbox_id| {
                    self.db.transaction(move |state| -> Result<()> {
                        let order_id = request.order_id;
                        if state.commit(request.reservation_id, now)? {
                            tracing::info!(%order_id, reservation_id = %request.reservation_id, "inventory committed");
                        }
                        emit(
                            state,
                            order_id,
                            &InventoryCommitted {
                                order_id,
                                reservation_id: request.reservation_id,
                            },
                            now,
                        )?;
                        state.inbox.mark_processed(inbox_id, now)?;
                        Ok(())
                    })
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ManualClock;
    use contracts::Contract;
    use messaging::{EventKind, MessagingError};
    use uuid::Uuid;

    async fn service() -> InventoryService {
        let service = InventoryService::new(
            InventoryDatabase::new(InventoryState::default()),
            Arc::new(ManualClock::default()),
        );
        service.add_stock(ProductId::new("SKU-A"), 10).await.unwrap();
        service.add_stock(ProductId::new("SKU-B"), 2).await.unwrap();
        service
    }

    fn inbound<P: Contract>(order_id: OrderId, payload: &P) -> InboundEvent {
        InboundEvent {
            event_id: Uuid::new_v4(),
            aggregate_id: order_id.as_uuid(),
            event_type: P::TYPE.as_str().to_string(),
            payload: serde_json::to_value(payload).unwrap(),
        }
    }

    fn line(sku: &str, quantity: u32) -> RequestedItem {
        RequestedItem {
            product_id: ProductId::new(sku),
            quantity,
        }
    }

    fn reserve_request(order_id: OrderId, items: Vec<RequestedItem>) -> InboundEvent {
        inbound(order_id, &InventoryReserveRequested { order_id, items })
    }

    async fn emitted(service: &InventoryService) -> Vec<String> {
        service
            .database()
            .read(|s| s.outbox.records().iter().map(|r| r.event_type.clone()).collect())
            .await
    }

    async fn levels(service: &InventoryService, sku: &str) -> (u32, u32) {
        let inv = service.inventory(&ProductId::new(sku)).await.unwrap();
        (inv.available_quantity(), inv.reserved_quantity())
    }

    #[tokio::test]
    async fn reserve_moves_stock_and_replies_in_one_transaction() {
        let service = service().await;
        let order_id = OrderId::new();
        let event = reserve_request(order_id, vec![line("SKU-A", 3), line("SKU-B", 1)]);

        assert_eq!(service.on_reserve_requested(&event).await.unwrap(), Handled::Processed);

        assert_eq!(levels(&service, "SKU-A").await, (7, 3));
        assert_eq!(levels(&service, "SKU-B").await, (1, 1));
        let reservation = service.reservation(order_id).await.unwrap();
        assert_eq!(reservation.items().len(), 2);
        assert_eq!(emitted(&service).await, vec!["InventoryReserved"]);
        let processed = service
            .database()
            .read(|s| s.inbox.find(INBOX_SCOPE, &event.event_type, &event.event_id.to_string()).map(|r| r.is_processed()))
            .await;
        assert_eq!(processed, Some(true));
    }

    #[tokio::test]
    async fn shortage_on_one_line_reserves_nothing() {
        let service = service().await;
        let order_id = OrderId::new();
        let event = reserve_request(order_id, vec![line("SKU-A", 3), line("SKU-B", 5)]);

        service.on_reserve_requested(&event).await.unwrap();

        assert_eq!(levels(&service, "SKU-A").await, (10, 0));
        assert_eq!(levels(&service, "SKU-B").await, (2, 0));
        assert!(service.reservation(order_id).await.is_none());
        assert_eq!(emitted(&service).await, vec!["InventoryReservationFailed"]);
    }

    #[tokio::test]
    async fn repeated_lines_for_one_product_are_summed() {
        let service = service().await;
        let event = reserve_request(OrderId::new(), vec![line("SKU-B", 1), line("SKU-B", 2)]);

        service.on_reserve_requested(&event).await.unwrap();

        assert_eq!(levels(&service, "SKU-B").await, (2, 0));
        assert_eq!(emitted(&service).await, vec!["InventoryReservationFailed"]);
    }

    #[tokio::test]
    async fn repeated_lines_past_u32_are_a_rejection() {
        let service = service().await;
        let half = u32::MAX / 2 + 1;
        let order_id = OrderId::new();
        let event = reserve_request(order_id, vec![line("SKU-A", half), line("SKU-A", half)]);

        assert_eq!(service.on_reserve_requested(&event).await.unwrap(), Handled::Processed);

        assert_eq!(levels(&service, "SKU-A").await, (10, 0));
        assert!(service.reservation(order_id).await.is_none());
        assert_eq!(emitted(&service).await, vec!["InventoryReservationFailed"]);
    }

    #[tokio::test]
    async fn unknown_product_is_a_rejection() {
        let service = service().await;
        let event = reserve_request(OrderId::new(), vec![line("SKU-Z", 1)]);
        service.on_reserve_requested(&event).await.unwrap();
        assert_eq!(emitted(&service).await, vec!["InventoryReservationFailed"]);
    }

    #[tokio::test]
    async fn redelivered_request_is_skipped() {
        let service = service().await;
        let event = reserve_request(OrderId::new(), vec![line("SKU-A", 4)]);

        assert_eq!(service.on_reserve_requested(&event).await.unwrap(), Handled::Processed);
        assert_eq!(service.on_reserve_requested(&event).await.unwrap(), Handled::Duplicate);

        assert_eq!(levels(&service, "SKU-A").await, (6, 4));
        assert_eq!(emitted(&service).await.len(), 1);
    }

    #[tokio::test]
    async fn second_request_for_same_order_reuses_reservation() {
        let service = service().await;
        let order_id = OrderId::new();

        service
            .on_reserve_requested(&reserve_request(order_id, vec![line("SKU-A", 4)]))
            .await
            .unwrap();
        service
            .on_reserve_requested(&reserve_request(order_id, vec![line("SKU-A", 4)]))
            .await
            .unwrap();

        assert_eq!(levels(&service, "SKU-A").await, (6, 4));
        assert_eq!(emitted(&service).await.len(), 1);
    }

    #[tokio::test]
    async fn release_restores_reserved_stock() {
        let service = service().await;
        let order_id = OrderId::new();
        service
            .on_reserve_requested(&reserve_request(order_id, vec![line("SKU-A", 4)]))
            .await
            .unwrap();
        let reservation_id = service.reservation(order_id).await.unwrap().id();

        let release = inbound(
            order_id,
            &InventoryReleaseRequested {
                order_id,
                reservation_id: Some(reservation_id),
                reason: "payment declined".to_string(),
            },
        );
        service.on_release_requested(&release).await.unwrap();

        assert_eq!(levels(&service, "SKU-A").await, (10, 0));
        assert_eq!(
            service.reservation(order_id).await.unwrap().status(),
            ReservationStatus::Released
        );
        assert_eq!(
            emitted(&service).await,
            vec!["InventoryReserved", "InventoryReleased"]
        );
    }

    #[tokio::test]
    async fn release_without_reservation_is_acknowledged() {
        let service = service().await;
        let order_id = OrderId::new();
        let release = inbound(
            order_id,
            &InventoryReleaseRequested {
                order_id,
                reservation_id: None,
                reason: "out of stock".to_string(),
            },
        );

        service.on_release_requested(&release).await.unwrap();

        assert_eq!(levels(&service, "SKU-A").await, (10, 0));
        let payload = service
            .database()
            .read(|s| s.outbox.records()[0].payload.clone())
            .await;
        let released: InventoryReleased = serde_json::from_value(payload).unwrap();
        assert_eq!(released.reservation_id, None);
    }

    #[tokio::test]
    async fn commit_removes_reserved_units() {
        let service = service().await;
        let order_id = OrderId::new();
        service
            .on_reserve_requested(&reserve_request(order_id, vec![line("SKU-A", 4)]))
            .await
            .unwrap();
        let reservation_id = service.reservation(order_id).await.unwrap().id();

        let commit = inbound(
            order_id,
            &InventoryCommitRequested {
                order_id,
                reservation_id,
            },
        );
        service.on_commit_requested(&commit).await.unwrap();

        assert_eq!(levels(&service, "SKU-A").await, (6, 0));
        assert_eq!(
            emitted(&service).await,
            vec!["InventoryReserved", "InventoryCommitted"]
        );
    }

    #[tokio::test]
    async fn commit_of_unknown_reservation_fails_and_is_left_for_retry() {
        let service = service().await;
        let order_id = OrderId::new();
        let commit = inbound(
            order_id,
            &InventoryCommitRequested {
                order_id,
                reservation_id: ReservationId::new(),
            },
        );

        let err = service.on_commit_requested(&commit).await.unwrap_err();
        assert!(matches!(err, InventoryError::ReservationNotFound(_)));
        let attempts = service
            .database()
            .read(|s| {
                s.inbox
                    .find(INBOX_SCOPE, &commit.event_type, &commit.event_id.to_string())
                    .map(|r| r.attempts)
            })
            .await;
        assert_eq!(attempts, Some(1));
        assert!(emitted(&service).await.is_empty());
    }

    #[tokio::test]
    async fn router_dispatches_by_event_type() {
        let service = Arc::new(service().await);
        let router = service.router().unwrap();
        let order_id = OrderId::new();

        router
            .on_message(&reserve_request(order_id, vec![line("SKU-A", 1)]))
            .await
            .unwrap();
        assert!(service.reservation(order_id).await.is_some());

        let stray = inbound(
            order_id,
            &contracts::PaymentFailed {
                order_id,
                payment_id: common::PaymentId::new(),
                reason: "x".to_string(),
            },
        );
        assert!(matches!(
            router.on_message(&stray).await,
            Err(MessagingError::Unrouted { .. })
        ));
    }

    #[test]
    fn converters_cover_every_emitted_type() {
        let registry = InventoryService::converters().unwrap();
        assert_eq!(registry.len(), EMITTED.len());
    }
}
