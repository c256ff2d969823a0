//! Inventory service.
//!
//! - [`Inventory`]: per-product stock with available and reserved quantities
//! - [`Reservation`]: stock held for one order
//! - [`InventoryService`]: handles reserve, release and commit requests from the
//!   order saga, replying through the inventory outbox

pub mod error;
pub mod inventory;
pub mod reservation;
pub mod service;

pub use error::{InventoryError, Result};
pub use inventory::{Inventory, InventoryStatus};
pub use reservation::{Reservation, ReservationItem, ReservationStatus};
pub use service::{
    EMITTED, INBOX_SCOPE, InventoryDatabase, InventoryService, InventoryState, ReservationOutcome,
};
