//! Reservation aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{InventoryId, OrderId, ProductId, ReservationId, Version};
use messaging::Entity;

use crate::error::{InventoryError, Result};

/// Unique constraint on the reservation's idempotency key (one per order).
pub const ORDER_KEY: &str = "reservation_idempotency_key";

/// Reservation lifecycle. Both transitions are one-shot.
///
/// ```text
/// Reserved ──► Committed
///    │             │
///    └─► Released ◄┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    #[default]
    Reserved,
    Committed,
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "RESERVED",
            ReservationStatus::Committed => "COMMITTED",
            ReservationStatus::Released => "RELEASED",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One reserved line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationItem {
    pub inventory_id: InventoryId,
    pub product_id: ProductId,
    pub quantity: u32,
}

/// Stock held for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    id: ReservationId,
    order_id: OrderId,
    idempotency_key: String,
    status: ReservationStatus,
    items: Vec<ReservationItem>,
    version: Version,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Entity for Reservation {
    type Id = ReservationId;
    const NAME: &'static str = "Reservation";

    fn id(&self) -> ReservationId {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn unique_keys(&self) -> Vec<(&'static str, String)> {
        vec![(ORDER_KEY, self.idempotency_key.clone())]
    }
}

impl Reservation {
    /// Idempotency key of the reservation made for `order_id`.
    pub fn key_for(order_id: OrderId) -> String {
        order_id.to_string()
    }

    /// A new reservation; needs at least one item, each with a positive quantity.
    pub fn new(order_id: OrderId, items: Vec<ReservationItem>, now: DateTime<Utc>) -> Result<Self> {
        if items.is_empty() {
            return Err(InventoryError::EmptyReservation(order_id));
        }
        if let Some(item) = items.iter().find(|item| item.quantity == 0) {
            return Err(InventoryError::InvalidQuantity {
                quantity: item.quantity,
            });
        }

        Ok(Self {
            id: ReservationId::new(),
            order_id,
            idempotency_key: Self::key_for(order_id),
            status: ReservationStatus::Reserved,
            items,
            version: Version::initial(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> ReservationId {
        self.id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn status(&self) -> ReservationStatus {
        self.status
    }

    pub fn items(&self) -> &[ReservationItem] {
        &self.items
    }

    pub fn total_quantity(&self) -> u64 {
        self.items.iter().map(|item| u64::from(item.quantity)).sum()
    }

    /// RESERVED → COMMITTED.
    pub fn commit(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != ReservationStatus::Reserved {
            return Err(InventoryError::transition(
                "Reservation",
                self.status,
                ReservationStatus::Committed,
            ));
        }
        self.status = ReservationStatus::Committed;
        self.updated_at = now;
        Ok(())
    }

    /// RESERVED or COMMITTED → RELEASED. Returns the status it was released from.
    pub fn release(&mut self, now: DateTime<Utc>) -> Result<ReservationStatus> {
        let from = self.status;
        if from == ReservationStatus::Released {
            return Err(InventoryError::transition(
                "Reservation",
                from,
                ReservationStatus::Released,
            ));
        }
        self.status = ReservationStatus::Released;
        self.updated_at = now;
        Ok(from)
    }
}
