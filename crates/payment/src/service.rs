//! Payment side of the fulfillment saga.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use common::{Clock, OrderId, PaymentId};
use contracts::{
    EventType, PaymentCommitRequested, PaymentCompleted, PaymentFailed, PaymentReleaseRequested,
    PaymentRequested, emit,
};
use messaging::{
    ConverterRegistry, EventRouter, Handled, IdempotencyGuard, InMemoryDatabase, InboundEvent,
    InboxTable, InboxTables, OutboxTable, OutboxTables, Table, handler_fn,
};

use crate::error::{PaymentError, Result};
use crate::gateway::{Authorization, AuthorizationRequest, PaymentGateway};
use crate::payment::{ORDER_KEY, Payment, PaymentStatus};

/// Inbox scope of the payment service.
pub const INBOX_SCOPE: &str = "payment";

/// Event types the payment service writes to its outbox.
pub const EMITTED: [EventType; 2] = [EventType::PaymentCompleted, EventType::PaymentFailed];

/// All payment tables, committed together.
#[derive(Debug, Clone, Default)]
pub struct PaymentState {
    pub payments: Table<Payment>,
    pub outbox: OutboxTable,
    pub inbox: InboxTable,
}

impl OutboxTables for PaymentState {
    fn outbox(&self) -> &OutboxTable {
        &self.outbox
    }

    fn outbox_mut(&mut self) -> &mut OutboxTable {
        &mut self.outbox
    }
}

impl InboxTables for PaymentState {
    fn inbox(&self) -> &InboxTable {
        &self.inbox
    }

    fn inbox_mut(&mut self) -> &mut InboxTable {
        &mut self.inbox
    }
}

pub type PaymentDatabase = InMemoryDatabase<PaymentState>;

impl PaymentState {
    pub fn payment_for(&self, order_id: OrderId) -> Option<&Payment> {
        self.payments.find_unique(ORDER_KEY, &Payment::key_for(order_id))
    }

    fn load_for_order(&self, payment_id: PaymentId, order_id: OrderId) -> Result<Payment> {
        let payment = self
            .payments
            .get(&payment_id)
            .ok_or(PaymentError::PaymentNotFound(payment_id))?;
        if payment.order_id() != order_id {
            return Err(PaymentError::OrderMismatch {
                payment_id,
                order_id,
            });
        }
        Ok(payment.clone())
    }
}

/// Writes the reply matching the payment's outcome.
fn reply(state: &mut PaymentState, payment: &Payment, now: DateTime<Utc>) -> Result<()> {
    let order_id = payment.order_id();
    match (payment.status(), payment.provider_payment_id()) {
        (PaymentStatus::Failed, _) => {
            emit(
                state,
                order_id,
                &PaymentFailed {
                    order_id,
                    payment_id: payment.id(),
                    reason: payment.failure_reason().unwrap_or("declined").to_string(),
                },
                now,
            )?;
        }
        (_, Some(provider_payment_id)) => {
            emit(
                state,
                order_id,
                &PaymentCompleted {
                    order_id,
                    payment_id: payment.id(),
                    provider_payment_id: provider_payment_id.to_string(),
                },
                now,
            )?;
        }
        (status, None) => {
            return Err(PaymentError::InvalidTransition {
                from: status,
                action: "reply for",
            });
        }
    }
    Ok(())
}

/// The payment service.
pub struct PaymentService {
    db: PaymentDatabase,
    guard: IdempotencyGuard<PaymentDatabase>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
}

impl PaymentService {
    pub fn new(db: PaymentDatabase, gateway: Arc<dyn PaymentGateway>, clock: Arc<dyn Clock>) -> Self {
        Self {
            guard: IdempotencyGuard::new(db.clone()),
            db,
            gateway,
            clock,
        }
    }

    pub fn database(&self) -> &PaymentDatabase {
        &self.db
    }

    /// Converters for everything this service emits.
    pub fn converters() -> messaging::Result<ConverterRegistry<EventType>> {
        contracts::converters(EMITTED)
    }

    /// Routes the `payment.requests` topic to this service.
    pub fn router(self: &Arc<Self>) -> messaging::Result<EventRouter<EventType>> {
        let requested = Arc::clone(self);
        let commit = Arc::clone(self);
        let release = Arc::clone(self);
        EventRouter::new([
            (
                EventType::PaymentRequested,
                handler_fn(move |event| {
                    let service = Arc::clone(&requested);
                    async move { service.on_payment_requested(&event).await.map(drop) }
                }),
            ),
            (
                EventType::PaymentCommitRequested,
                handler_fn(move |event| {
                    let service = Arc::clone(&commit);
                    async move { service.on_commit_requested(&event).await.map(drop) }
                }),
            ),
            (
                EventType::PaymentReleaseRequested,
                handler_fn(move |event| {
                    let service = Arc::clone(&release);
                    async move { service.on_release_requested(&event).await.map(drop) }
                }),
            ),
        ])
    }

    pub async fn payment(&self, order_id: OrderId) -> Option<Payment> {
        self.db.read(|state| state.payment_for(order_id).cloned()).await
    }

    /// Takes payment for an order.
    ///
    /// The payment row is created first so the gateway is always asked with
    /// the same idempotency key, then the gateway's answer is recorded
    /// together with the reply event.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn on_payment_requested(&self, event: &InboundEvent) -> Result<Handled> {
        let request: PaymentRequested = event.decode()?;

        self.guard
            .handle(
                INBOX_SCOPE,
                &event.event_type,
                &event.event_id.to_string(),
                event.payload.clone(),
                self.clock.as_ref(),
                |inbox_id| async move {
                    let order_id = request.order_id;
                    let now = self.clock.now();
                    let payment = self
                        .db
                        .transaction(|state| -> Result<Payment> {
                            if let Some(existing) = state.payment_for(order_id) {
                                return Ok(existing.clone());
                            }
                            let payment = Payment::new(
                                order_id,
                                request.user_id,
                                request.amount,
                                request.currency.clone(),
                                now,
                            );
                            Ok(state.payments.insert(payment)?)
                        })
                        .await?;

                    let decision = if payment.status() == PaymentStatus::Created {
                        let authorization = self
                            .gateway
                            .authorize(&AuthorizationRequest {
                                idempotency_key: payment.id().to_string(),
                                order_id,
                                user_id: payment.user_id(),
                                amount: payment.amount(),
                                currency: payment.currency().clone(),
                            })
                            .await?;
                        Some(authorization)
                    } else {
                        None
                    };

                    let now = self.clock.now();
                    self.db
                        .transaction(move |state| -> Result<()> {
                            let mut payment = state.payments.load(&payment.id())?;
                            match decision {
                                Some(Authorization::Approved { provider_payment_id }) => {
                                    payment.approve(provider_payment_id, now)?;
                                    payment = state.payments.update(payment)?;
                                    tracing::info!(%order_id, payment_id = %payment.id(), "payment approved");
                                    metrics::counter!("payments_total", "outcome" => "approved").increment(1);
                                }
                                Some(Authorization::Declined { reason }) => {
                                    tracing::info!(%order_id, %reason, "payment declined");
                                    payment.fail(reason, now)?;
                                    payment = state.payments.update(payment)?;
                                    metrics::counter!("payments_total", "outcome" => "declined").increment(1);
                                }
                                None => {}
                            }
                            reply(state, &payment, now)?;
                            state.inbox.mark_processed(inbox_id, now)?;
                            Ok(())
                        })
                        .await
                },
            )
            .await
    }

    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn on_commit_requested(&self, event: &InboundEvent) -> Result<Handled> {
        let request: PaymentCommitRequested = event.decode()?;

        self.guard
            .handle(
                INBOX_SCOPE,
                &event.event_type,
                &event.event_id.to_string(),
                event.payload.clone(),
                self.clock.as_ref(),
                |inbox_id| async move {
                    let payment = self
                        .db
                        .read(|state| state.load_for_order(request.payment_id, request.order_id))
                        .await?;
                    if payment.status() == PaymentStatus::Approved
                        && let Some(provider_payment_id) = payment.provider_payment_id()
                    {
                        self.gateway.capture(provider_payment_id).await?;
                    }

                    let now = self.clock.now();
                    self.db
                        .transaction(move |state| -> Result<()> {
                            let mut payment = state.load_for_order(request.payment_id, request.order_id)?;
                            if payment.status() != PaymentStatus::Commited {
                                payment.commit(now)?;
                                state.payments.update(payment)?;
                                tracing::info!(order_id = %request.order_id, "payment committed");
                            }
                            state.inbox.mark_processed(inbox_id, now)?;
                            Ok(())
                        })
                        .await
                },
            )
            .await
    }

    /// Voids an approved payment for an order that could not be completed.
    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id))]
    pub async fn on_release_requested(&self, event: &InboundEvent) -> Result<Handled> {
        let request: PaymentReleaseRequested = event.decode()?;

        self.guard
            .handle(
                INBOX_SCOPE,
                &event.event_type,
                &event.event_id.to_string(),
                event.payload.clone(),
                self.clock.as_ref(),
                |inbox_id| async move {
                    let payment = self
                        .db
                        .read(|state| state.load_for_order(request.payment_id, request.order_id))
                        .await?;
                    if payment.status() == PaymentStatus::Approved
                        && let Some(provider_payment_id) = payment.provider_payment_id()
                    {
                        self.gateway.void(provider_payment_id).await?;
                    }

                    let now = self.clock.now();
                    self.db
                        .transaction(move |state| -> Result<()> {
                            let mut payment = state.load_for_order(request.payment_id, request.order_id)?;
                            match payment.status() {
                                PaymentStatus::Released | PaymentStatus::Failed => {}
                                _ => {
                                    payment.release(now)?;
                                    state.payments.update(payment)?;
                                    tracing::info!(order_id = %request.order_id, reason = %request.reason, "payment released");
                                }
                            }
                            state.inbox.mark_processed(inbox_id, now)?;
                            Ok(())
                        })
                        .await
                },
            )
            .await
    }
}
