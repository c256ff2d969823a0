//! Transactional messaging shared by every service.
//!
//! The pieces, from the bottom up:
//!
//! - [`OutboxRecord`] / [`InboxRecord`] and their store ports, with in-memory
//!   ([`InMemoryDatabase`]) and PostgreSQL implementations
//! - [`IdempotencyGuard`] for at-least-once inbound delivery
//! - [`OutboxPublisher`], which claims records under a lease, converts them
//!   with a [`ConverterRegistry`] and sends them through an [`EventProducer`]
//! - [`EventRouter`] and [`EventConsumer`] on the receiving side
//! - [`PeriodicTask`] to drive publishers on a timer
//! - [`RetentionSweep`] to prune published outbox and processed inbox rows
//!
//! Everything is generic over an [`EventKind`] enum so each service plugs in
//! its own event types.

pub mod bus;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod inbox;
pub mod kind;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod publisher;
pub mod registry;
pub mod retention;
pub mod retry;
pub mod router;
pub mod scheduler;

pub use bus::{EventProducer, InMemoryEventBus, SentMessage, Subscription};
pub use consumer::{ConsumeReport, EventConsumer};
pub use envelope::{InboundEvent, OutboundEvent};
pub use error::{ConflictAware, MessagingError, Result};
pub use inbox::{
    AsMessagingError, Handled, IdempotencyGuard, InboxRecord, InboxStatus, InboxStore, Recorded,
};
pub use kind::EventKind;
pub use memory::{Entity, InMemoryDatabase, InboxTable, InboxTables, OutboxTable, OutboxTables, Table};
pub use outbox::{OutboxRecord, OutboxStatus, OutboxStore};
pub use postgres::{PostgresInboxStore, PostgresOutboxStore, run_migrations};
pub use publisher::{OutboxPublisher, PublishReport, PublisherConfig};
pub use registry::{ConverterRegistry, EventConverter, JsonConverter, Registry, WirePayload};
pub use retention::{RetentionReport, RetentionSweep};
pub use retry::{RetryDecision, RetryPolicy, retry_on_conflict};
pub use router::{BoxError, EventHandler, EventRouter, handler_fn};
pub use scheduler::PeriodicTask;
