//! Event payloads, one record per event type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::{Currency, Money, OrderId, PaymentId, ProductId, ReservationId, UserId};
use messaging::{OutboxRecord, WirePayload};

use crate::event_type::EventType;

/// A payload bound to its event type.
pub trait Contract: WirePayload {
    const TYPE: EventType;

    /// Builds a `PENDING` outbox record carrying this payload.
    ///
    /// `key` is the record's idempotency key; emitting the same logical event
    /// twice with the same key is rejected by the outbox's unique constraint.
    fn to_outbox(
        &self,
        aggregate_id: impl Into<Uuid>,
        key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> messaging::Result<OutboxRecord> {
        OutboxRecord::pending(aggregate_id, Self::TYPE, key, self, now)
    }
}

/// Conventional outbox idempotency key: one event of each type per order.
pub fn outbox_key(event_type: EventType, order_id: OrderId) -> String {
    format!("{event_type}:{order_id}")
}

/// A product and quantity in a reservation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedItem {
    pub product_id: ProductId,
    pub quantity: u32,
}

macro_rules! contract {
    ($payload:ident => $event:ident) => {
        impl Contract for $payload {
            const TYPE: EventType = EventType::$event;
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReserveRequested {
    pub order_id: OrderId,
    pub items: Vec<RequestedItem>,
}

impl WirePayload for InventoryReserveRequested {}
contract!(InventoryReserveRequested => InventoryReserveRequested);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReleaseRequested {
    pub order_id: OrderId,
    /// Absent when the reservation itself failed.
    pub reservation_id: Option<ReservationId>,
    pub reason: String,
}

impl WirePayload for InventoryReleaseRequested {
    fn reservation_id(&self) -> Option<Uuid> {
        self.reservation_id.map(Into::into)
    }
}
contract!(InventoryReleaseRequested => InventoryReleaseRequested);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryCommitRequested {
    pub order_id: OrderId,
    pub reservation_id: ReservationId,
}

impl WirePayload for InventoryCommitRequested {
    fn reservation_id(&self) -> Option<Uuid> {
        Some(self.reservation_id.into())
    }
}
contract!(InventoryCommitRequested => InventoryCommitRequested);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReserved {
    pub order_id: OrderId,
    pub reservation_id: ReservationId,
}

impl WirePayload for InventoryReserved {
    fn reservation_id(&self) -> Option<Uuid> {
        Some(self.reservation_id.into())
    }
}
contract!(InventoryReserved => InventoryReserved);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReservationFailed {
    pub order_id: OrderId,
    pub reason: String,
}

impl WirePayload for InventoryReservationFailed {}
contract!(InventoryReservationFailed => InventoryReservationFailed);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryReleased {
    pub order_id: OrderId,
    pub reservation_id: Option<ReservationId>,
}

impl WirePayload for InventoryReleased {
    fn reservation_id(&self) -> Option<Uuid> {
        self.reservation_id.map(Into::into)
    }
}
contract!(InventoryReleased => InventoryReleased);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryCommitted {
    pub order_id: OrderId,
    pub reservation_id: ReservationId,
}

impl WirePayload for InventoryCommitted {
    fn reservation_id(&self) -> Option<Uuid> {
        Some(self.reservation_id.into())
    }
}
contract!(InventoryCommitted => InventoryCommitted);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequested {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub amount: Money,
    pub currency: Currency,
}

impl WirePayload for PaymentRequested {}
contract!(PaymentRequested => PaymentRequested);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCommitRequested {
    pub order_id: OrderId,
    pub payment_id: PaymentId,
}

impl WirePayload for PaymentCommitRequested {
    fn payment_id(&self) -> Option<Uuid> {
        Some(self.payment_id.into())
    }
}
contract!(PaymentCommitRequested => PaymentCommitRequested);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReleaseRequested {
    pub order_id: OrderId,
    pub payment_id: PaymentId,
    pub reason: String,
}

impl WirePayload for PaymentReleaseRequested {
    fn payment_id(&self) -> Option<Uuid> {
        Some(self.payment_id.into())
    }
}
contract!(PaymentReleaseRequested => PaymentReleaseRequested);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCompleted {
    pub order_id: OrderId,
    pub payment_id: PaymentId,
    pub provider_payment_id: String,
}

impl WirePayload for PaymentCompleted {
    fn payment_id(&self) -> Option<Uuid> {
        Some(self.payment_id.into())
    }
}
contract!(PaymentCompleted => PaymentCompleted);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailed {
    pub order_id: OrderId,
    pub payment_id: PaymentId,
    pub reason: String,
}

impl WirePayload for PaymentFailed {
    fn payment_id(&self) -> Option<Uuid> {
        Some(self.payment_id.into())
    }
}
contract!(PaymentFailed => PaymentFailed);
