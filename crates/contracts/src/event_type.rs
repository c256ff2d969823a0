//! The cross-service event-type enum.

use serde::{Deserialize, Serialize};

use messaging::EventKind;

/// Topic consumed by the inventory service.
pub const INVENTORY_REQUESTS: &str = "inventory.requests";
/// Topic consumed by the payment service.
pub const PAYMENT_REQUESTS: &str = "payment.requests";
/// Topic consumed by the order service's saga coordinator.
pub const ORDER_REPLIES: &str = "order.replies";

/// Every event exchanged between services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Order → inventory
    InventoryReserveRequested,
    InventoryReleaseRequested,
    InventoryCommitRequested,

    // Inventory → order
    InventoryReserved,
    InventoryReservationFailed,
    InventoryReleased,
    InventoryCommitted,

    // Order → payment
    PaymentRequested,
    PaymentCommitRequested,
    PaymentReleaseRequested,

    // Payment → order
    PaymentCompleted,
    PaymentFailed,
}

impl EventType {
    pub const ALL: [EventType; 12] = [
        EventType::InventoryReserveRequested,
        EventType::InventoryReleaseRequested,
        EventType::InventoryCommitRequested,
        EventType::InventoryReserved,
        EventType::InventoryReservationFailed,
        EventType::InventoryReleased,
        EventType::InventoryCommitted,
        EventType::PaymentRequested,
        EventType::PaymentCommitRequested,
        EventType::PaymentReleaseRequested,
        EventType::PaymentCompleted,
        EventType::PaymentFailed,
    ];

    /// Event types carried on `topic`.
    pub fn on_topic(topic: &str) -> impl Iterator<Item = EventType> + '_ {
        Self::ALL.into_iter().filter(move |t| t.topic() == topic)
    }
}

impl EventKind for EventType {
    fn as_str(&self) -> &'static str {
        match self {
            EventType::InventoryReserveRequested => "InventoryReserveRequested",
            EventType::InventoryReleaseRequested => "InventoryReleaseRequested",
            EventType::InventoryCommitRequested => "InventoryCommitRequested",
            EventType::InventoryReserved => "InventoryReserved",
            EventType::InventoryReservationFailed => "InventoryReservationFailed",
            EventType::InventoryReleased => "InventoryReleased",
            EventType::InventoryCommitted => "InventoryCommitted",
            EventType::PaymentRequested => "PaymentRequested",
            EventType::PaymentCommitRequested => "PaymentCommitRequested",
            EventType::PaymentReleaseRequested => "PaymentReleaseRequested",
            EventType::PaymentCompleted => "PaymentCompleted",
            EventType::PaymentFailed => "PaymentFailed",
        }
    }

    fn topic(&self) -> &'static str {
        match self {
            EventType::InventoryReserveRequested
            | EventType::InventoryReleaseRequested
            | EventType::InventoryCommitRequested => INVENTORY_REQUESTS,
            EventType::PaymentRequested
            | EventType::PaymentCommitRequested
            | EventType::PaymentReleaseRequested => PAYMENT_REQUESTS,
            EventType::InventoryReserved
            | EventType::InventoryReservationFailed
            | EventType::InventoryReleased
            | EventType::InventoryCommitted
            | EventType::PaymentCompleted
            | EventType::PaymentFailed => ORDER_REPLIES,
        }
    }

    fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
