//! Inventory error types.

use common::{InventoryId, OrderId, ProductId, ReservationId};
use messaging::{AsMessagingError, ConflictAware, MessagingError};
use thiserror::Error;

/// Errors that can occur in the inventory service.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// Not enough available stock.
    #[error("Insufficient inventory {inventory_id}: requested {requested}, available {available}")]
    InsufficientInventory {
        inventory_id: InventoryId,
        requested: u32,
        available: u32,
    },

    /// Quantities must be positive.
    #[error("Invalid quantity: {quantity}")]
    InvalidQuantity { quantity: u32 },

    /// The aggregate is not in a state that permits the transition.
    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// A reservation needs at least one item.
    #[error("Reservation for order {0} has no items")]
    EmptyReservation(OrderId),

    /// No stock row for the product.
    #[error("No inventory for product {0}")]
    UnknownProduct(ProductId),

    /// The reservation named by a commit request does not exist.
    #[error("Reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    /// An error from the messaging or storage layer.
    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

impl InventoryError {
    pub(crate) fn transition(entity: &'static str, from: impl ToString, to: impl ToString) -> Self {
        InventoryError::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl AsMessagingError for InventoryError {
    fn as_messaging(&self) -> Option<&MessagingError> {
        match self {
            InventoryError::Messaging(e) => Some(e),
            _ => None,
        }
    }
}

impl ConflictAware for InventoryError {
    fn is_conflict(&self) -> bool {
        matches!(self, InventoryError::Messaging(e) if e.is_conflict())
    }
}

impl From<serde_json::Error> for InventoryError {
    fn from(e: serde_json::Error) -> Self {
        InventoryError::Messaging(MessagingError::Serialization(e))
    }
}

/// Convenience type alias for inventory results.
pub type Result<T> = std::result::Result<T, InventoryError>;
