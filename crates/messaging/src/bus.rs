//! Event bus producer port and an in-process bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use tokio::sync::{Mutex, mpsc};

use crate::envelope::{InboundEvent, OutboundEvent};
use crate::error::{MessagingError, Result};

/// Sends events to a topic, partitioned by key.
///
/// Returning `Ok` means the broker acknowledged the event.
#[async_trait]
pub trait EventProducer: Send + Sync {
    async fn send(&self, topic: &str, key: &str, event: &OutboundEvent) -> Result<()>;
}

/// A message as recorded by [`InMemoryEventBus`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub topic: String,
    pub key: String,
    pub event: OutboundEvent,
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<InboundEvent>>>,
    sent: Vec<SentMessage>,
    fail_next: usize,
    latency: Option<Duration>,
}

/// In-process event bus.
///
/// Every subscriber of a topic receives every event sent to it. Failures and
/// latency can be injected to exercise the publisher's retry path.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to a topic.
    pub async fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .await
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Subscription {
            topic: topic.to_string(),
            rx,
        }
    }

    /// Makes the next `n` sends fail.
    pub async fn fail_next(&self, n: usize) {
        self.state.lock().await.fail_next = n;
    }

    /// Delays every send by `latency` before acknowledging.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    /// Every acknowledged send, in order.
    pub async fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().await.sent.clone()
    }

    /// Acknowledged sends of one event type.
    pub async fn sent_of_type(&self, event_type: &str) -> Vec<SentMessage> {
        self.state
            .lock()
            .await
            .sent
            .iter()
            .filter(|m| m.event.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventProducer for InMemoryEventBus {
    async fn send(&self, topic: &str, key: &str, event: &OutboundEvent) -> Result<()> {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(MessagingError::Publish(format!(
                "broker unavailable for topic {topic}"
            )));
        }

        state.sent.push(SentMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            event: event.clone(),
        });
        if let Some(subscribers) = state.subscribers.get_mut(topic) {
            let inbound = InboundEvent::from(event);
            subscribers.retain(|tx| tx.send(inbound.clone()).is_ok());
        }
        Ok(())
    }
}

/// Receiving end of a topic subscription.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<InboundEvent>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next event. Returns `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.rx.recv().await
    }

    /// Takes every event already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<InboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Turns the subscription into a stream of events.
    pub fn into_stream(self) -> impl Stream<Item = InboundEvent> + Send {
        stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }
}
