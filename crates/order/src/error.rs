//! Order service error types.

use common::OrderId;
use messaging::{AsMessagingError, ConflictAware, MessagingError};
use thiserror::Error;

/// Errors that can occur in the order service.
#[derive(Debug, Error)]
pub enum OrderError {
    /// Malformed or out-of-range input. Never retried.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A state machine precondition was violated.
    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// No order with this id.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// A reply arrived before the order's saga was created.
    #[error("No saga for order {0}")]
    SagaNotFound(OrderId),

    /// The saga is missing data the next step needs.
    #[error("Saga for order {order_id} has no {field}")]
    MissingSagaField {
        order_id: OrderId,
        field: &'static str,
    },

    /// The catalog lookup failed.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// The saga bootstrap transaction did not finish in time.
    #[error("Saga bootstrap for order {0} timed out")]
    BootstrapTimeout(OrderId),

    /// An error from the messaging or storage layer.
    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

impl OrderError {
    pub(crate) fn transition(entity: &'static str, from: impl ToString, to: impl ToString) -> Self {
        OrderError::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl AsMessagingError for OrderError {
    fn as_messaging(&self) -> Option<&MessagingError> {
        match self {
            OrderError::Messaging(e) => Some(e),
            _ => None,
        }
    }
}

impl ConflictAware for OrderError {
    fn is_conflict(&self) -> bool {
        matches!(self, OrderError::Messaging(e) if e.is_conflict())
    }
}

impl From<serde_json::Error> for OrderError {
    fn from(e: serde_json::Error) -> Self {
        OrderError::Messaging(MessagingError::Serialization(e))
    }
}

/// Convenience type alias for order results.
pub type Result<T> = std::result::Result<T, OrderError>;
