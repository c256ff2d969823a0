//! Wire envelopes exchanged over the event bus.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// An event as a consumer sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl InboundEvent {
    /// Deserializes the payload into its contract type.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// An event as the publisher sends it.
///
/// `event_id` is the outbox record id, so republishing the same record
/// carries the same id and consumers can deduplicate on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    pub event_id: Uuid,
    pub outbox_id: Uuid,
    pub aggregate_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<Uuid>,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl OutboundEvent {
    /// Partition key on the bus.
    pub fn key(&self) -> String {
        self.aggregate_id.to_string()
    }
}

impl From<&OutboundEvent> for InboundEvent {
    fn from(event: &OutboundEvent) -> Self {
        Self {
            event_id: event.event_id,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_serializes_camel_case_and_omits_absent_ids() {
        let id = Uuid::new_v4();
        let event = OutboundEvent {
            event_id: id,
            outbox_id: id,
            aggregate_id: Uuid::new_v4(),
            reservation_id: None,
            payment_id: None,
            event_type: "InventoryReserved".to_string(),
            payload: serde_json::json!({"orderId": "x"}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("eventId").is_some());
        assert!(json.get("aggregateId").is_some());
        assert!(json.get("reservationId").is_none());
    }

    #[test]
    fn inbound_keeps_event_id_of_outbound() {
        let outbound = OutboundEvent {
            event_id: Uuid::new_v4(),
            outbox_id: Uuid::new_v4(),
            aggregate_id: Uuid::new_v4(),
            reservation_id: Some(Uuid::new_v4()),
            payment_id: None,
            event_type: "PaymentCompleted".to_string(),
            payload: serde_json::json!({"amount": 10}),
        };
        let inbound = InboundEvent::from(&outbound);
        assert_eq!(inbound.event_id, outbound.event_id);
        assert_eq!(inbound.aggregate_id, outbound.aggregate_id);

        #[derive(Deserialize)]
        struct Body {
            amount: i64,
        }
        assert_eq!(inbound.decode::<Body>().unwrap().amount, 10);
    }
}
