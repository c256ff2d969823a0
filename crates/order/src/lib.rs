//! Order service.
//!
//! - [`Order`]: what the user bought, with prices fixed at placement
//! - [`Saga`]: where fulfillment of one order stands
//! - [`OrderService`]: `place_order` and `get_orders`
//! - [`SagaCoordinator`]: moves the saga forward, or into compensation, as
//!   inventory and payment reply
//! - [`SagaRecovery`]: bootstraps sagas that placement left unfinished

pub mod catalog;
pub mod command;
pub mod coordinator;
pub mod error;
pub mod order;
pub mod recovery;
pub mod saga;
pub mod service;

pub use catalog::{CatalogPort, InMemoryCatalog, PriceSnapshot};
pub use command::{OrderLine, PlaceOrder};
pub use coordinator::{INBOX_SCOPE, SagaCoordinator};
pub use error::{OrderError, Result};
pub use order::{Order, OrderItem, OrderStatus};
pub use recovery::{RecoveryReport, SagaRecovery};
pub use saga::{Saga, SagaStatus};
pub use service::{
    EMITTED, OrderDatabase, OrderService, OrderServiceConfig, OrderState, OrderSummary, Page,
};
