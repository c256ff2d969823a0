//! Payment service.
//!
//! Takes payment when the order saga asks for it, through a [`PaymentGateway`],
//! and replies `PaymentCompleted` or `PaymentFailed` through its outbox.
//! Approved payments are later committed (captured) or released (voided).

pub mod error;
pub mod gateway;
pub mod payment;
pub mod service;

pub use error::{PaymentError, Result};
pub use gateway::{Authorization, AuthorizationRequest, InMemoryPaymentGateway, PaymentGateway};
pub use payment::{Payment, PaymentStatus};
pub use service::{EMITTED, INBOX_SCOPE, PaymentDatabase, PaymentService, PaymentState};
