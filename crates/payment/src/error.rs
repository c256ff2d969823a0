//! Payment error types.

use common::{OrderId, PaymentId};
use messaging::{AsMessagingError, ConflictAware, MessagingError};
use thiserror::Error;

use crate::payment::PaymentStatus;

/// Errors that can occur in the payment service.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// The payment is not in a state that permits the action.
    #[error("Cannot {action} payment in status {from}")]
    InvalidTransition {
        from: PaymentStatus,
        action: &'static str,
    },

    /// No payment with this id.
    #[error("Payment not found: {0}")]
    PaymentNotFound(PaymentId),

    /// A payment belongs to a different order than the request claims.
    #[error("Payment {payment_id} does not belong to order {order_id}")]
    OrderMismatch {
        payment_id: PaymentId,
        order_id: OrderId,
    },

    /// The payment provider could not be reached. Transient.
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// An error from the messaging or storage layer.
    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

impl AsMessagingError for PaymentError {
    fn as_messaging(&self) -> Option<&MessagingError> {
        match self {
            PaymentError::Messaging(e) => Some(e),
            _ => None,
        }
    }
}

impl ConflictAware for PaymentError {
    fn is_conflict(&self) -> bool {
        matches!(self, PaymentError::Messaging(e) if e.is_conflict())
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(e: serde_json::Error) -> Self {
        PaymentError::Messaging(MessagingError::Serialization(e))
    }
}

/// Convenience type alias for payment results.
pub type Result<T> = std::result::Result<T, PaymentError>;
