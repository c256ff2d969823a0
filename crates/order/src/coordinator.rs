//! Saga coordinator: applies inventory and payment replies to the order saga.
//!
//! | reply                        | saga                                      | order          | emits                     |
//! |------------------------------|-------------------------------------------|----------------|---------------------------|
//! | `InventoryReserved`          | reserved, payment requested               | PAYING         | `PaymentRequested`        |
//! | `InventoryReservationFailed` | inventory released                        | FAIL           | `InventoryReleaseRequested` |
//! | `PaymentCompleted`           | payment completed                         | PAID           | `InventoryCommitRequested` |
//! | `PaymentFailed`              | inventory released                        | PAYMENT_FAILED | `InventoryReleaseRequested` |
//! | `InventoryReleased`          | failed                                    |                |                           |
//! | `InventoryCommitted`         | completed                                 | COMPLETED      | `PaymentCommitRequested`  |
//!
//! A payment that completes after the saga started compensating is given back
//! with `PaymentReleaseRequested`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use common::{Clock, OrderId};
use contracts::{
    EventType, InventoryCommitRequested, InventoryCommitted, InventoryReleaseRequested,
    InventoryReleased, InventoryReservationFailed, InventoryReserved, PaymentCommitRequested,
    PaymentCompleted, PaymentFailed, PaymentReleaseRequested, PaymentRequested, emit,
};
use messaging::{EventRouter, Handled, IdempotencyGuard, InboundEvent, handler_fn, retry_on_conflict};

use crate::error::{OrderError, Result};
use crate::order::OrderStatus;
use crate::saga::{Saga, SagaStatus};
use crate::service::{OrderDatabase, OrderState};

/// Inbox scope of the order service.
pub const INBOX_SCOPE: &str = "order";

/// Drives each order's saga from the replies on `order.replies`.
pub struct SagaCoordinator {
    db: OrderDatabase,
    guard: IdempotencyGuard<OrderDatabase>,
    clock: Arc<dyn Clock>,
    conflict_retries: u32,
}

impl SagaCoordinator {
    pub fn new(db: OrderDatabase, clock: Arc<dyn Clock>, conflict_retries: u32) -> Self {
        Self {
            guard: IdempotencyGuard::new(db.clone()),
            db,
            clock,
            conflict_retries: conflict_retries.max(1),
        }
    }

    /// Routes the `order.replies` topic to this coordinator.
    pub fn router(self: &Arc<Self>) -> messaging::Result<EventRouter<EventType>> {
        macro_rules! route {
            ($this:expr, $kind:expr, $method:ident) => {{
                let coordinator = Arc::clone($this);
                (
                    $kind,
                    handler_fn(move |event| {
                        let coordinator = Arc::clone(&coordinator);
                        async move { coordinator.$method(&event).await.map(drop) }
                    }),
                )
            }};
        }

        EventRouter::new([
            route!(self, EventType::InventoryReserved, on_inventory_reserved),
            route!(self, EventType::InventoryReservationFailed, on_reservation_failed),
            route!(self, EventType::PaymentCompleted, on_payment_completed),
            route!(self, EventType::PaymentFailed, on_payment_failed),
            route!(self, EventType::InventoryReleased, on_inventory_released),
            route!(self, EventType::InventoryCommitted, on_inventory_committed),
        ])
    }

    /// Stock is held: ask for payment.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn on_inventory_reserved(&self, event: &InboundEvent) -> Result<Handled> {
        let reply: InventoryReserved = event.decode()?;
        let order_id = reply.order_id;

        self.apply(event, order_id, move |state, now| {
            let mut saga = state.load_saga(order_id)?;
            if saga.reservation_id() == Some(reply.reservation_id) {
                tracing::debug!(%order_id, status = %saga.status(), "reservation already applied");
                return Ok(());
            }
            saga.mark_inventory_reserved(reply.reservation_id, now)?;
            saga.mark_payment_requested(now)?;
            state.sagas.update(saga)?;

            let mut order = state.load_order(order_id)?;
            if order.status() == OrderStatus::Created {
                order.mark_paying(now)?;
                order = state.orders.update(order)?;
            }
            emit(
                state,
                order_id,
                &PaymentRequested {
                    order_id,
                    user_id: order.user_id(),
                    amount: order.total_amount(),
                    currency: order.currency().clone(),
                },
                now,
            )?;
            tracing::info!(%order_id, reservation_id = %reply.reservation_id, "inventory reserved, payment requested");
            Ok(())
        })
        .await
    }

    /// Stock could not be held: fail the order and release whatever is left.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn on_reservation_failed(&self, event: &InboundEvent) -> Result<Handled> {
        let reply: InventoryReservationFailed = event.decode()?;
        let order_id = reply.order_id;

        self.apply(event, order_id, move |state, now| {
            let mut saga = state.load_saga(order_id)?;
            if saga.status().is_compensating() {
                tracing::debug!(%order_id, "reservation failure already applied");
                return Ok(());
            }
            saga.mark_inventory_released(reply.reason.clone(), now)?;
            let saga = state.sagas.update(saga)?;

            let mut order = state.load_order(order_id)?;
            order.mark_failed(now)?;
            state.orders.update(order)?;

            request_release(state, &saga, &reply.reason, now)?;
            tracing::info!(%order_id, reason = %reply.reason, "inventory reservation failed");
            Ok(())
        })
        .await
    }

    /// Payment taken: commit the reserved stock.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn on_payment_completed(&self, event: &InboundEvent) -> Result<Handled> {
        let reply: PaymentCompleted = event.decode()?;
        let order_id = reply.order_id;

        self.apply(event, order_id, move |state, now| {
            let mut saga = state.load_saga(order_id)?;
            match saga.status() {
                SagaStatus::PaymentRequested => {}
                status if status.is_compensating() => {
                    saga.record_payment_released(reply.payment_id, now)?;
                    let saga = state.sagas.update(saga)?;
                    emit(
                        state,
                        order_id,
                        &PaymentReleaseRequested {
                            order_id,
                            payment_id: reply.payment_id,
                            reason: saga.fail_reason().unwrap_or("order compensated").to_string(),
                        },
                        now,
                    )?;
                    tracing::warn!(%order_id, payment_id = %reply.payment_id, "payment completed after compensation, releasing");
                    return Ok(());
                }
                _ if saga.payment_id() == Some(reply.payment_id) => {
                    tracing::debug!(%order_id, "payment completion already applied");
                    return Ok(());
                }
                _ => {}
            }

            saga.mark_payment_completed(reply.payment_id, now)?;
            let saga = state.sagas.update(saga)?;
            let reservation_id = saga.reservation_id().ok_or(OrderError::MissingSagaField {
                order_id,
                field: "reservation_id",
            })?;

            let mut order = state.load_order(order_id)?;
            order.mark_paid(now)?;
            state.orders.update(order)?;

            emit(
                state,
                order_id,
                &InventoryCommitRequested {
                    order_id,
                    reservation_id,
                },
                now,
            )?;
            tracing::info!(%order_id, payment_id = %reply.payment_id, "payment completed");
            Ok(())
        })
        .await
    }

    /// Payment declined: release the reserved stock.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn on_payment_failed(&self, event: &InboundEvent) -> Result<Handled> {
        let reply: PaymentFailed = event.decode()?;
        let order_id = reply.order_id;

        self.apply(event, order_id, move |state, now| {
            let mut saga = state.load_saga(order_id)?;
            match saga.status() {
                SagaStatus::PaymentRequested => {}
                status if status.is_compensating() => {
                    tracing::debug!(%order_id, "payment failure already applied");
                    return Ok(());
                }
                status => {
                    return Err(OrderError::transition("Saga", status, SagaStatus::InventoryReleased));
                }
            }
            saga.record_payment(reply.payment_id);
            saga.mark_inventory_released(reply.reason.clone(), now)?;
            let saga = state.sagas.update(saga)?;

            let mut order = state.load_order(order_id)?;
            order.mark_payment_failed(now)?;
            state.orders.update(order)?;

            request_release(state, &saga, &reply.reason, now)?;
            tracing::info!(%order_id, reason = %reply.reason, "payment failed");
            Ok(())
        })
        .await
    }

    /// Compensation acknowledged: the saga is over.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn on_inventory_released(&self, event: &InboundEvent) -> Result<Handled> {
        let reply: InventoryReleased = event.decode()?;
        let order_id = reply.order_id;

        self.apply(event, order_id, move |state, now| {
            let mut saga = state.load_saga(order_id)?;
            if saga.status() == SagaStatus::Failed {
                tracing::debug!(%order_id, "inventory release already applied");
                return Ok(());
            }
            if saga.status() != SagaStatus::InventoryReleased {
                return Err(OrderError::transition("Saga", saga.status(), SagaStatus::Failed));
            }
            saga.fail("inventory released", now)?;
            state.sagas.update(saga)?;
            tracing::info!(%order_id, "saga failed after compensation");
            metrics::counter!("sagas_finished_total", "outcome" => "failed").increment(1);
            Ok(())
        })
        .await
    }

    /// Stock committed: complete the order and capture the payment.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn on_inventory_committed(&self, event: &InboundEvent) -> Result<Handled> {
        let reply: InventoryCommitted = event.decode()?;
        let order_id = reply.order_id;

        self.apply(event, order_id, move |state, now| {
            let mut saga = state.load_saga(order_id)?;
            if saga.status() == SagaStatus::Completed {
                tracing::debug!(%order_id, "inventory commit already applied");
                return Ok(());
            }
            saga.mark_completed(now)?;
            let saga = state.sagas.update(saga)?;
            let payment_id = saga.payment_id().ok_or(OrderError::MissingSagaField {
                order_id,
                field: "payment_id",
            })?;

            let mut order = state.load_order(order_id)?;
            order.mark_completed(now)?;
            state.orders.update(order)?;

            emit(
                state,
                order_id,
                &PaymentCommitRequested {
                    order_id,
                    payment_id,
                },
                now,
            )?;
            tracing::info!(%order_id, "order completed");
            metrics::counter!("sagas_finished_total", "outcome" => "completed").increment(1);
            Ok(())
        })
        .await
    }

    /// Runs `step` once per inbound event, retrying version conflicts, and
    /// marks the inbox record processed in the same transaction.
    ///
    /// A reply can overtake the saga bootstrap of its order; the saga is then
    /// created here so the reply is applied instead of exhausting redelivery.
    async fn apply<F>(&self, event: &InboundEvent, order_id: OrderId, step: F) -> Result<Handled>
    where
        F: Fn(&mut OrderState, DateTime<Utc>) -> Result<()> + Sync,
    {
        let step = &step;
        self.guard
            .handle(
                INBOX_SCOPE,
                &event.event_type,
                &event.event_id.to_string(),
                event.payload.clone(),
                self.clock.as_ref(),
                |inbox_id| {
                    retry_on_conflict(self.conflict_retries, move || async move {
                        let now = self.clock.now();
                        self.db
                            .transaction(|state| -> Result<()> {
                                if state.bootstrap_saga(order_id, now)? {
                                    tracing::warn!(%order_id, event_type = %event.event_type, "saga bootstrapped by reply");
                                    metrics::counter!("saga_bootstraps_by_reply_total").increment(1);
                                }
                                step(state, now)?;
                                state.inbox.mark_processed(inbox_id, now)?;
                                Ok(())
                            })
                            .await
                    })
                },
            )
            .await
    }
}

/// Asks inventory to release whatever it holds for the saga's order.
fn request_release(
    state: &mut OrderState,
    saga: &Saga,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let order_id: OrderId = saga.order_id();
    emit(
        state,
        order_id,
        &InventoryReleaseRequested {
            order_id,
            reservation_id: saga.reservation_id(),
            reason: reason.to_string(),
        },
        now,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Currency, ManualClock, Money, PaymentId, ReservationId, UserId};
    use contracts::Contract;
    use messaging::EventKind;
    use uuid::Uuid;

    use crate::order::{Order, OrderItem};

    struct Fixture {
        db: OrderDatabase,
        coordinator: SagaCoordinator,
        order_id: OrderId,
    }

    async fn fixture() -> Fixture {
        let db = OrderDatabase::new(OrderState::default());
        let now = Utc::now();
        let order = Order::place(
            UserId::new(),
            "k",
            vec![OrderItem {
                product_id: "A".into(),
                quantity: 2,
                unit_price: Money::from_cents(500),
            }],
            Currency::parse("USD").unwrap(),
            now,
        )
        .unwrap();
        let order_id = order.id();
        db.transaction(|state| -> Result<()> {
            state.orders.insert(order)?;
            state.bootstrap_saga(order_id, now)?;
            Ok(())
        })
        .await
        .unwrap();

        Fixture {
            coordinator: SagaCoordinator::new(db.clone(), Arc::new(ManualClock::default()), 3),
            db,
            order_id,
        }
    }

    fn inbound<P: Contract>(order_id: OrderId, payload: &P) -> InboundEvent {
        InboundEvent {
            event_id: Uuid::new_v4(),
            aggregate_id: order_id.as_uuid(),
            event_type: P::TYPE.as_str().to_string(),
            payload: serde_json::to_value(payload).unwrap(),
        }
    }

    impl Fixture {
        async fn saga(&self) -> Saga {
            self.db.read(|s| s.saga_for(self.order_id).cloned()).await.unwrap()
        }

        async fn order_status(&self) -> OrderStatus {
            self.db
                .read(|s| s.orders.get(&self.order_id).map(Order::status))
                .await
                .unwrap()
        }

        async fn emitted(&self) -> Vec<String> {
            self.db
                .read(|s| s.outbox.records().iter().map(|r| r.event_type.clone()).collect())
                .await
        }

        async fn reserved(&self) -> ReservationId {
            let reservation_id = ReservationId::new();
            self.coordinator
                .on_inventory_reserved(&inbound(
                    self.order_id,
                    &InventoryReserved {
                        order_id: self.order_id,
                        reservation_id,
                    },
                ))
                .await
                .unwrap();
            reservation_id
        }
    }

    #[tokio::test]
    async fn success_path_completes_saga_and_order() {
        let f = fixture().await;
        let order_id = f.order_id;
        let reservation_id = f.reserved().await;
        assert_eq!(f.saga().await.status(), SagaStatus::PaymentRequested);
        assert_eq!(f.order_status().await, OrderStatus::Paying);

        let payment_id = PaymentId::new();
        f.coordinator
            .on_payment_completed(&inbound(
                order_id,
                &PaymentCompleted {
                    order_id,
                    payment_id,
                    provider_payment_id: "PAY-0001".to_string(),
                },
            ))
            .await
            .unwrap();
        assert_eq!(f.order_status().await, OrderStatus::Paid);

        f.coordinator
            .on_inventory_committed(&inbound(
                order_id,
                &InventoryCommitted {
                    order_id,
                    reservation_id,
                },
            ))
            .await
            .unwrap();

        let saga = f.saga().await;
        assert_eq!(saga.status(), SagaStatus::Completed);
        assert_eq!(saga.payment_id(), Some(payment_id));
        assert_eq!(f.order_status().await, OrderStatus::Completed);
        assert_eq!(
            f.emitted().await,
            vec![
                "PaymentRequested",
                "InventoryCommitRequested",
                "PaymentCommitRequested"
            ]
        );
    }

    #[tokio::test]
    async fn reservation_failure_releases_then_fails() {
        let f = fixture().await;
        let order_id = f.order_id;
        f.coordinator
            .on_reservation_failed(&inbound(
                order_id,
                &InventoryReservationFailed {
                    order_id,
                    reason: "insufficient stock".to_string(),
                },
            ))
            .await
            .unwrap();
        assert_eq!(f.saga().await.status(), SagaStatus::InventoryReleased);
        assert_eq!(f.order_status().await, OrderStatus::Fail);
        assert_eq!(f.emitted().await, vec!["InventoryReleaseRequested"]);

        f.coordinator
            .on_inventory_released(&inbound(
                order_id,
                &InventoryReleased {
                    order_id,
                    reservation_id: None,
                },
            ))
            .await
            .unwrap();

        let saga = f.saga().await;
        assert_eq!(saga.status(), SagaStatus::Failed);
        assert_eq!(saga.fail_reason(), Some("insufficient stock"));
        assert!(saga.payment_requested_at().is_none());
    }

    #[tokio::test]
    async fn payment_failure_compensates_reservation() {
        let f = fixture().await;
        let order_id = f.order_id;
        let reservation_id = f.reserved().await;

        f.coordinator
            .on_payment_failed(&inbound(
                order_id,
                &PaymentFailed {
                    order_id,
                    payment_id: PaymentId::new(),
                    reason: "card declined".to_string(),
                },
            ))
            .await
            .unwrap();
        let saga = f.saga().await;
        assert_eq!(saga.status(), SagaStatus::InventoryReleased);
        assert_eq!(f.order_status().await, OrderStatus::PaymentFailed);

        let release: InventoryReleaseRequested = f
            .db
            .read(|s| {
                s.outbox
                    .records()
                    .iter()
                    .find(|r| r.event_type == "InventoryReleaseRequested")
                    .map(|r| serde_json::from_value(r.payload.clone()).unwrap())
            })
            .await
            .unwrap();
        assert_eq!(release.reservation_id, Some(reservation_id));

        f.coordinator
            .on_inventory_released(&inbound(
                order_id,
                &InventoryReleased {
                    order_id,
                    reservation_id: Some(reservation_id),
                },
            ))
            .await
            .unwrap();
        let saga = f.saga().await;
        assert_eq!(saga.status(), SagaStatus::Failed);
        assert!(saga.inventory_released_at().is_some());
    }

    #[tokio::test]
    async fn late_payment_is_released() {
        let f = fixture().await;
        let order_id = f.order_id;
        f.coordinator
            .on_reservation_failed(&inbound(
                order_id,
                &InventoryReservationFailed {
                    order_id,
                    reason: "timeout".to_string(),
                },
            ))
            .await
            .unwrap();

        let payment_id = PaymentId::new();
        f.coordinator
            .on_payment_completed(&inbound(
                order_id,
                &PaymentCompleted {
                    order_id,
                    payment_id,
                    provider_payment_id: "PAY-0009".to_string(),
                },
            ))
            .await
            .unwrap();

        let saga = f.saga().await;
        assert_eq!(saga.status(), SagaStatus::InventoryReleased);
        assert!(saga.payment_released_at().is_some());
        assert_eq!(f.order_status().await, OrderStatus::Fail);
        assert_eq!(
            f.emitted().await,
            vec!["InventoryReleaseRequested", "PaymentReleaseRequested"]
        );
    }

    #[tokio::test]
    async fn redelivered_reply_is_a_duplicate() {
        let f = fixture().await;
        let event = inbound(
            f.order_id,
            &InventoryReserved {
                order_id: f.order_id,
                reservation_id: ReservationId::new(),
            },
        );
        assert_eq!(
            f.coordinator.on_inventory_reserved(&event).await.unwrap(),
            Handled::Processed
        );
        assert_eq!(
            f.coordinator.on_inventory_reserved(&event).await.unwrap(),
            Handled::Duplicate
        );
        assert_eq!(f.emitted().await, vec!["PaymentRequested"]);
    }

    #[tokio::test]
    async fn out_of_order_reply_is_an_invalid_transition() {
        let f = fixture().await;
        let order_id = f.order_id;
        let err = f
            .coordinator
            .on_inventory_committed(&inbound(
                order_id,
                &InventoryCommitted {
                    order_id,
                    reservation_id: ReservationId::new(),
                },
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition { entity: "Saga", .. }));
        assert_eq!(f.saga().await.status(), SagaStatus::InventoryRequested);
    }

    #[tokio::test]
    async fn reply_before_saga_bootstraps_it() {
        let db = OrderDatabase::new(OrderState::default());
        let now = Utc::now();
        let order = Order::place(
            UserId::new(),
            "k",
            vec![OrderItem {
                product_id: "A".into(),
                quantity: 1,
                unit_price: Money::from_cents(100),
            }],
            Currency::parse("USD").unwrap(),
            now,
        )
        .unwrap();
        let order_id = order.id();
        db.transaction(|state| state.orders.insert(order).map(drop))
            .await
            .unwrap();
        let coordinator = SagaCoordinator::new(db.clone(), Arc::new(ManualClock::default()), 3);
        let reservation_id = ReservationId::new();
        let event = inbound(
            order_id,
            &InventoryReserved {
                order_id,
                reservation_id,
            },
        );

        assert_eq!(
            coordinator.on_inventory_reserved(&event).await.unwrap(),
            Handled::Processed
        );

        let (saga, processed) = db
            .read(|s| {
                let processed = s
                    .inbox
                    .find(INBOX_SCOPE, "InventoryReserved", &event.event_id.to_string())
                    .is_some_and(|r| r.is_processed());
                (s.saga_for(order_id).cloned(), processed)
            })
            .await;
        let saga = saga.unwrap();
        assert_eq!(saga.status(), SagaStatus::PaymentRequested);
        assert_eq!(saga.reservation_id(), Some(reservation_id));
        assert!(processed);
    }

    #[tokio::test]
    async fn reply_for_unknown_order_is_retried() {
        let db = OrderDatabase::new(OrderState::default());
        let coordinator = SagaCoordinator::new(db.clone(), Arc::new(ManualClock::default()), 3);
        let order_id = OrderId::new();
        let event = inbound(
            order_id,
            &InventoryReserved {
                order_id,
                reservation_id: ReservationId::new(),
            },
        );

        let err = coordinator.on_inventory_reserved(&event).await.unwrap_err();
        assert!(matches!(err, OrderError::OrderNotFound(id) if id == order_id));

        let record = db
            .read(|s| {
                s.inbox
                    .find(INBOX_SCOPE, "InventoryReserved", &event.event_id.to_string())
                    .cloned()
            })
            .await
            .unwrap();
        assert!(!record.is_processed());
        assert!(db.read(|s| s.saga_for(order_id).is_none()).await);
    }
}
