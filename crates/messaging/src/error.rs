use common::Version;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the outbox, inbox, routing and storage layers.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// A write targeted a stale row version.
    #[error(
        "Concurrency conflict on {entity} {id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        entity: &'static str,
        id: String,
        expected: Version,
        actual: Version,
    },

    /// An insert collided with an existing row on a unique constraint.
    #[error("Unique constraint '{constraint}' violated on {entity}")]
    UniqueViolation {
        entity: &'static str,
        constraint: String,
    },

    /// The row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The inbox record was already marked processed by another delivery.
    #[error("Inbox record {id} already processed")]
    AlreadyProcessed { id: Uuid },

    /// A row is not in a state that permits the requested action.
    #[error("Cannot {action} {entity} {id} in status {status}")]
    InvalidStatus {
        entity: &'static str,
        id: String,
        status: String,
        action: &'static str,
    },

    /// No handler is registered for the event type.
    #[error("No handler registered for event type '{event_type}'")]
    Unrouted { event_type: String },

    /// The same event type was registered twice in one registry.
    #[error("Event type '{event_type}' registered twice in {registry}")]
    DuplicateRegistration {
        registry: &'static str,
        event_type: String,
    },

    /// The publisher has no converter for a record's event type.
    #[error("No converter registered for event type '{event_type}'")]
    MissingConverter { event_type: String },

    /// The event bus rejected the message.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The event bus did not acknowledge within the publish timeout.
    #[error("Publish of event {event_id} timed out after {timeout_ms}ms")]
    PublishTimeout { event_id: Uuid, timeout_ms: u64 },

    /// An inbound event handler failed.
    #[error("Handler failed: {0}")]
    Handler(Box<dyn std::error::Error + Send + Sync>),

    /// Invalid configuration detected at startup.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MessagingError {
    /// Returns true for optimistic-lock conflicts, which callers may retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, MessagingError::ConcurrencyConflict { .. })
    }
}

/// Errors that may carry an optimistic-lock conflict worth retrying.
pub trait ConflictAware {
    fn is_conflict(&self) -> bool;
}

impl ConflictAware for MessagingError {
    fn is_conflict(&self) -> bool {
        MessagingError::is_conflict(self)
    }
}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;
