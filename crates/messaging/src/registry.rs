//! Dispatch tables keyed by event type, and the outbox → envelope converters.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::envelope::OutboundEvent;
use crate::error::{MessagingError, Result};
use crate::kind::EventKind;
use crate::outbox::OutboxRecord;

/// An immutable map from event type to a value, built once at startup.
#[derive(Debug, Clone)]
pub struct Registry<K, V> {
    name: &'static str,
    entries: HashMap<K, V>,
}

impl<K: EventKind, V> Registry<K, V> {
    /// Builds the registry from declared pairs.
    ///
    /// Registering the same event type twice is a startup error.
    pub fn build(name: &'static str, pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self> {
        let mut entries = HashMap::new();
        for (kind, value) in pairs {
            if entries.insert(kind, value).is_some() {
                return Err(MessagingError::DuplicateRegistration {
                    registry: name,
                    event_type: kind.as_str().to_string(),
                });
            }
        }
        Ok(Self { name, entries })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self, kind: &K) -> Option<&V> {
        self.entries.get(kind)
    }

    /// Looks a value up by the wire name of its event type.
    pub fn get_by_name(&self, name: &str) -> Option<&V> {
        K::parse(name).and_then(|kind| self.entries.get(&kind))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A payload type that travels on the bus.
///
/// Payloads that refer to a reservation or a payment expose the id so the
/// publisher can lift it into the envelope.
pub trait WirePayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn reservation_id(&self) -> Option<Uuid> {
        None
    }

    fn payment_id(&self) -> Option<Uuid> {
        None
    }
}

/// Turns a claimed outbox record into the envelope sent on the bus.
pub trait EventConverter: Send + Sync {
    fn convert(&self, record: &OutboxRecord) -> Result<OutboundEvent>;
}

/// Converter that validates the payload against its contract type.
pub struct JsonConverter<P> {
    _payload: PhantomData<fn() -> P>,
}

impl<P> JsonConverter<P> {
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<P> Default for JsonConverter<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: WirePayload> EventConverter for JsonConverter<P> {
    fn convert(&self, record: &OutboxRecord) -> Result<OutboundEvent> {
        let payload: P = serde_json::from_value(record.payload.clone())?;
        Ok(OutboundEvent {
            event_id: record.id,
            outbox_id: record.id,
            aggregate_id: record.aggregate_id,
            reservation_id: payload.reservation_id(),
            payment_id: payload.payment_id(),
            event_type: record.event_type.clone(),
            payload: record.payload.clone(),
        })
    }
}

/// Event type → converter table used by the outbox publisher.
pub type ConverterRegistry<K> = Registry<K, Arc<dyn EventConverter>>;

impl<K: EventKind> Registry<K, Arc<dyn EventConverter>> {
    /// Converts a record, failing if its type has no converter.
    pub fn convert(&self, record: &OutboxRecord) -> Result<(K, OutboundEvent)> {
        let kind = K::parse(&record.event_type).ok_or_else(|| MessagingError::MissingConverter {
            event_type: record.event_type.clone(),
        })?;
        let converter = self
            .get(&kind)
            .ok_or_else(|| MessagingError::MissingConverter {
                event_type: record.event_type.clone(),
            })?;
        Ok((kind, converter.convert(record)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::Deserialize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Charged,
        Refunded,
    }

    impl EventKind for Kind {
        fn as_str(&self) -> &'static str {
            match self {
                Kind::Charged => "Charged",
                Kind::Refunded => "Refunded",
            }
        }

        fn topic(&self) -> &'static str {
            "billing"
        }

        fn parse(name: &str) -> Option<Self> {
            match name {
                "Charged" => Some(Kind::Charged),
                "Refunded" => Some(Kind::Refunded),
                _ => None,
            }
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Charged {
        payment_id: Uuid,
    }

    impl WirePayload for Charged {
        fn payment_id(&self) -> Option<Uuid> {
            Some(self.payment_id)
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let err = Registry::build("handlers", [(Kind::Charged, 1), (Kind::Charged, 2)]).unwrap_err();
        assert!(matches!(
            err,
            MessagingError::DuplicateRegistration { registry: "handlers", ref event_type }
                if event_type == "Charged"
        ));
    }

    #[test]
    fn converter_lifts_ids_and_keeps_record_id() {
        let converters: ConverterRegistry<Kind> = Registry::build(
            "converters",
            [(
                Kind::Charged,
                Arc::new(JsonConverter::<Charged>::new()) as Arc<dyn EventConverter>,
            )],
        )
        .unwrap();

        let payment_id = Uuid::new_v4();
        let record = OutboxRecord::pending(
            Uuid::new_v4(),
            Kind::Charged,
            "k",
            &Charged { payment_id },
            Utc::now(),
        )
        .unwrap();

        let (kind, event) = converters.convert(&record).unwrap();
        assert_eq!(kind, Kind::Charged);
        assert_eq!(event.event_id, record.id);
        assert_eq!(event.payment_id, Some(payment_id));
        assert_eq!(event.reservation_id, None);
    }

    #[test]
    fn unregistered_type_is_a_missing_converter() {
        let converters: ConverterRegistry<Kind> = Registry::build("converters", []).unwrap();
        let record = OutboxRecord::pending(
            Uuid::new_v4(),
            Kind::Refunded,
            "k",
            &serde_json::json!({}),
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(
            converters.convert(&record),
            Err(MessagingError::MissingConverter { .. })
        ));
    }
}
