//! Outbox publisher: claim, convert, publish and reconcile.

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::Clock;
use uuid::Uuid;

use crate::bus::EventProducer;
use crate::error::{MessagingError, Result};
use crate::kind::EventKind;
use crate::outbox::{OutboxRecord, OutboxStore};
use crate::registry::ConverterRegistry;
use crate::retry::{RetryDecision, RetryPolicy};

/// Publisher tuning.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Identifies this publisher in `locked_by`.
    pub worker_id: String,
    pub batch_size: usize,
    pub lease: Duration,
    pub publish_timeout: Duration,
    pub retry: RetryPolicy,
}

impl PublisherConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("publisher-{}", Uuid::new_v4()),
            batch_size: 50,
            lease: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// What one publisher run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub dead: usize,
    /// Records whose lease expired and was taken over before reconcile.
    pub lost_lease: usize,
}

impl PublishReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }
}

/// Publishes one service's outbox to the event bus.
pub struct OutboxPublisher<K: EventKind> {
    store: Arc<dyn OutboxStore>,
    producer: Arc<dyn EventProducer>,
    converters: ConverterRegistry<K>,
    clock: Arc<dyn Clock>,
    config: PublisherConfig,
}

impl<K: EventKind> OutboxPublisher<K> {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        producer: Arc<dyn EventProducer>,
        converters: ConverterRegistry<K>,
        clock: Arc<dyn Clock>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            store,
            producer,
            converters,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Claims one batch and publishes every record in it.
    #[tracing::instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run_once(&self) -> Result<PublishReport> {
        let now = self.clock.now();
        let batch = self
            .store
            .claim_batch(
                &self.config.worker_id,
                self.config.batch_size,
                self.config.lease,
                now,
            )
            .await?;

        let mut report = PublishReport {
            claimed: batch.len(),
            ..PublishReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }
        metrics::counter!("outbox_claimed_total").increment(batch.len() as u64);

        for record in batch {
            self.publish_record(record, &mut report).await?;
        }

        tracing::info!(
            claimed = report.claimed,
            published = report.published,
            retried = report.retried,
            dead = report.dead,
            lost_lease = report.lost_lease,
            "outbox batch processed"
        );
        Ok(report)
    }

    /// Runs until a batch comes back empty. Returns the summed report.
    pub async fn drain(&self) -> Result<PublishReport> {
        let mut total = PublishReport::default();
        loop {
            let report = self.run_once().await?;
            if report.is_idle() {
                return Ok(total);
            }
            total.claimed += report.claimed;
            total.published += report.published;
            total.retried += report.retried;
            total.dead += report.dead;
            total.lost_lease += report.lost_lease;
        }
    }

    async fn publish_record(&self, record: OutboxRecord, report: &mut PublishReport) -> Result<()> {
        let started = Instant::now();
        let outcome = self.send(&record).await;
        metrics::histogram!("outbox_publish_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let now = self.clock.now();
        let worker_id = &self.config.worker_id;
        match outcome {
            Ok(()) => {
                if self.store.mark_published(record.id, worker_id, now).await? {
                    metrics::counter!("outbox_published_total").increment(1);
                    report.published += 1;
                } else {
                    tracing::warn!(outbox_id = %record.id, "lease lost before publish was recorded");
                    report.lost_lease += 1;
                }
            }
            Err(e) => {
                let decision = self.config.retry.decide(record.attempts_in_budget() + 1, now);
                match &e {
                    MessagingError::MissingConverter { .. } => {
                        tracing::error!(outbox_id = %record.id, event_type = %record.event_type, error = %e, "outbox record cannot be converted");
                    }
                    _ => {
                        tracing::warn!(outbox_id = %record.id, event_type = %record.event_type, attempt = decision.attempt(), error = %e, "outbox publish failed");
                    }
                }

                let error = e.to_string();
                if !self
                    .store
                    .mark_failed(record.id, worker_id, &decision, &error, now)
                    .await?
                {
                    tracing::warn!(outbox_id = %record.id, "lease lost before failure was recorded");
                    report.lost_lease += 1;
                    return Ok(());
                }
                match decision {
                    RetryDecision::RetryAt { .. } => {
                        metrics::counter!("outbox_retry_scheduled_total").increment(1);
                        report.retried += 1;
                    }
                    RetryDecision::Dead { attempt } => {
                        tracing::error!(outbox_id = %record.id, event_type = %record.event_type, attempt, "outbox record is dead");
                        metrics::counter!("outbox_dead_total").increment(1);
                        report.dead += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn send(&self, record: &OutboxRecord) -> Result<()> {
        let (kind, event) = self.converters.convert(record)?;
        let key = event.key();
        let send = self.producer.send(kind.topic(), &key, &event);
        match tokio::time::timeout(self.config.publish_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(MessagingError::PublishTimeout {
                event_id: event.event_id,
                timeout_ms: u64::try_from(self.config.publish_timeout.as_millis())
                    .unwrap_or(u64::MAX),
            }),
        }
    }
}
