//! Shared building blocks for the order fulfillment services.
//!
//! - Typed identifiers so an order id can never be passed where a payment id is expected
//! - [`Version`] for optimistic concurrency on every aggregate row
//! - [`Money`] and [`Currency`] for price snapshots and payments
//! - [`Clock`] port so time-dependent logic (leases, backoff) is testable

pub mod clock;
pub mod money;
pub mod types;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use money::{Currency, Money};
pub use types::{
    InventoryId, OrderId, PaymentId, ProductId, ReservationId, SagaId, UserId,
};
pub use version::Version;
