//! Wire contracts between the order, inventory and payment services.
//!
//! Each service instantiates the generic messaging components with
//! [`EventType`] and registers converters for the events it emits via
//! [`converters`].

pub mod event_type;
pub mod payloads;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::OrderId;
use messaging::{
    ConverterRegistry, EventConverter, JsonConverter, MessagingError, OutboxTables, Registry,
};

pub use event_type::{EventType, INVENTORY_REQUESTS, ORDER_REPLIES, PAYMENT_REQUESTS};
pub use payloads::*;

/// Converter for one event type.
pub fn converter_for(event_type: EventType) -> Arc<dyn EventConverter> {
    match event_type {
        EventType::InventoryReserveRequested => {
            Arc::new(JsonConverter::<InventoryReserveRequested>::new())
        }
        EventType::InventoryReleaseRequested => {
            Arc::new(JsonConverter::<InventoryReleaseRequested>::new())
        }
        EventType::InventoryCommitRequested => {
            Arc::new(JsonConverter::<InventoryCommitRequested>::new())
        }
        EventType::InventoryReserved => Arc::new(JsonConverter::<InventoryReserved>::new()),
        EventType::InventoryReservationFailed => {
            Arc::new(JsonConverter::<InventoryReservationFailed>::new())
        }
        EventType::InventoryReleased => Arc::new(JsonConverter::<InventoryReleased>::new()),
        EventType::InventoryCommitted => Arc::new(JsonConverter::<InventoryCommitted>::new()),
        EventType::PaymentRequested => Arc::new(JsonConverter::<PaymentRequested>::new()),
        EventType::PaymentCommitRequested => {
            Arc::new(JsonConverter::<PaymentCommitRequested>::new())
        }
        EventType::PaymentReleaseRequested => {
            Arc::new(JsonConverter::<PaymentReleaseRequested>::new())
        }
        EventType::PaymentCompleted => Arc::new(JsonConverter::<PaymentCompleted>::new()),
        EventType::PaymentFailed => Arc::new(JsonConverter::<PaymentFailed>::new()),
    }
}

/// Builds the converter registry for the event types a service emits.
pub fn converters(
    emitted: impl IntoIterator<Item = EventType>,
) -> messaging::Result<ConverterRegistry<EventType>> {
    Registry::build(
        "outbox converters",
        emitted.into_iter().map(|t| (t, converter_for(t))),
    )
}

/// Writes `payload` to the service outbox under its per-order key.
///
/// Every event is partitioned by order id. Returns `false` when the same event
/// type was already emitted for the order, which happens when a handler
/// replays after its first run committed.
pub fn emit<P: Contract, S: OutboxTables>(
    state: &mut S,
    order_id: OrderId,
    payload: &P,
    now: DateTime<Utc>,
) -> messaging::Result<bool> {
    let record = payload.to_outbox(order_id, outbox_key(P::TYPE, order_id), now)?;
    match state.outbox_mut().insert(record) {
        Ok(()) => Ok(true),
        Err(MessagingError::UniqueViolation { .. }) => {
            let event_type = P::TYPE;
            tracing::debug!(%order_id, %event_type, "event already in outbox");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
