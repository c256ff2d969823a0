//! Inbound event routing.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::InboundEvent;
use crate::error::{MessagingError, Result};
use crate::kind::EventKind;
use crate::registry::Registry;

/// Boxed error returned by handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Handles one event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &InboundEvent) -> std::result::Result<(), BoxError>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps `f` as a shareable handler.
pub fn handler_fn<F, Fut, E>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(InboundEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    Arc::new(FnHandler { f })
}

#[async_trait]
impl<F, Fut, E> EventHandler for FnHandler<F>
where
    F: Fn(InboundEvent) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), E>> + Send,
    E: Into<BoxError>,
{
    async fn handle(&self, event: &InboundEvent) -> std::result::Result<(), BoxError> {
        (self.f)(event.clone()).await.map_err(Into::into)
    }
}

/// Dispatches each inbound event to the single handler registered for its type.
pub struct EventRouter<K> {
    handlers: Registry<K, Arc<dyn EventHandler>>,
}

impl<K: EventKind> EventRouter<K> {
    /// Builds the router; a type registered twice is a startup error.
    pub fn new(pairs: impl IntoIterator<Item = (K, Arc<dyn EventHandler>)>) -> Result<Self> {
        Ok(Self {
            handlers: Registry::build("event router", pairs)?,
        })
    }

    /// Returns true if a handler exists for the type.
    pub fn routes(&self, kind: K) -> bool {
        self.handlers.get(&kind).is_some()
    }

    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type, event_id = %event.event_id))]
    pub async fn on_message(&self, event: &InboundEvent) -> Result<()> {
        let handler = self.handlers.get_by_name(&event.event_type).ok_or_else(|| {
            tracing::error!("no handler registered");
            MessagingError::Unrouted {
                event_type: event.event_type.clone(),
            }
        })?;

        handler.handle(event).await.map_err(MessagingError::Handler)
    }
}
