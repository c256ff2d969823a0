//! Bus consumers feeding an [`EventRouter`].

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::watch;

use crate::bus::Subscription;
use crate::envelope::InboundEvent;
use crate::kind::EventKind;
use crate::retry::RetryPolicy;
use crate::router::EventRouter;

/// Pulls events from one subscription and dispatches them.
///
/// A failed dispatch is redelivered with backoff until the retry budget is
/// spent, after which the event is logged and dropped.
pub struct EventConsumer<K: EventKind> {
    name: &'static str,
    subscription: Subscription,
    router: Arc<EventRouter<K>>,
    retry: RetryPolicy,
    redelivery: VecDeque<(InboundEvent, u32)>,
}

/// What one [`EventConsumer::poll_once`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeReport {
    pub handled: usize,
    pub failed: usize,
    pub dropped: usize,
}

impl<K: EventKind> EventConsumer<K> {
    pub fn new(
        name: &'static str,
        subscription: Subscription,
        router: Arc<EventRouter<K>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name,
            subscription,
            router,
            retry,
            redelivery: VecDeque::new(),
        }
    }

    /// Events waiting to be redelivered.
    pub fn pending_redelivery(&self) -> usize {
        self.redelivery.len()
    }

    /// Dispatches every event that is already waiting, without blocking.
    ///
    /// Events that failed on an earlier poll are retried first; a failure
    /// here queues the event for the next poll.
    pub async fn poll_once(&mut self) -> ConsumeReport {
        let mut report = ConsumeReport::default();
        let mut batch: Vec<(InboundEvent, u32)> = self.redelivery.drain(..).collect();
        batch.extend(self.subscription.drain().into_iter().map(|e| (e, 0)));

        for (event, failures) in batch {
            match self.router.on_message(&event).await {
                Ok(()) => report.handled += 1,
                Err(e) => {
                    let failures = failures + 1;
                    if failures > self.retry.max_retries {
                        tracing::error!(consumer = self.name, event_id = %event.event_id, event_type = %event.event_type, error = %e, "giving up on event");
                        report.dropped += 1;
                    } else {
                        tracing::warn!(consumer = self.name, event_id = %event.event_id, event_type = %event.event_type, failures, error = %e, "event handling failed, will redeliver");
                        report.failed += 1;
                        self.redelivery.push_back((event, failures));
                    }
                }
            }
        }
        report
    }

    /// Consumes until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(consumer = self.name, topic = self.subscription.topic(), "consumer started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                next = self.subscription.recv() => {
                    let Some(event) = next else { break };
                    self.deliver(event).await;
                }
            }
        }
        tracing::info!(consumer = self.name, "consumer stopped");
    }

    async fn deliver(&self, event: InboundEvent) {
        let mut failures = 0u32;
        loop {
            match self.router.on_message(&event).await {
                Ok(()) => return,
                Err(e) => {
                    failures += 1;
                    if failures > self.retry.max_retries {
                        tracing::error!(consumer = self.name, event_id = %event.event_id, event_type = %event.event_type, error = %e, "giving up on event");
                        return;
                    }
                    let delay = self.retry.backoff(failures);
                    tracing::warn!(consumer = self.name, event_id = %event.event_id, failures, delay_ms = delay.as_millis() as u64, error = %e, "event handling failed, redelivering");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
