//! Deletes outbox and inbox rows that no longer do any work.

use std::sync::Arc;
use std::time::Duration;

use common::Clock;

use crate::error::Result;
use crate::inbox::InboxStore;
use crate::outbox::OutboxStore;
use crate::retry::to_chrono;

/// Rows removed by one [`RetentionSweep::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub outbox: usize,
    pub inbox: usize,
}

/// Prunes published outbox records and processed inbox records older than
/// the retention window.
///
/// Pending, retrying and dead outbox records and unfinished inbox records are
/// never touched. The window must outlast redelivery: a pruned inbox key is
/// handled again if its event shows up afterwards.
pub struct RetentionSweep {
    outboxes: Vec<(&'static str, Arc<dyn OutboxStore>)>,
    inboxes: Vec<(&'static str, Arc<dyn InboxStore>)>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl RetentionSweep {
    pub fn new(clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            outboxes: Vec::new(),
            inboxes: Vec::new(),
            clock,
            retention,
        }
    }

    pub fn with_outbox(mut self, name: &'static str, store: Arc<dyn OutboxStore>) -> Self {
        self.outboxes.push((name, store));
        self
    }

    pub fn with_inbox(mut self, name: &'static str, store: Arc<dyn InboxStore>) -> Self {
        self.inboxes.push((name, store));
        self
    }

    /// Runs one sweep over every registered table.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> Result<RetentionReport> {
        let cutoff = self.clock.now() - to_chrono(self.retention);
        let mut report = RetentionReport::default();

        for (name, store) in &self.outboxes {
            let pruned = store.prune_published(cutoff).await?;
            if pruned > 0 {
                tracing::debug!(service = *name, pruned, "pruned published outbox records");
                metrics::counter!("outbox_records_pruned_total", "service" => *name)
                    .increment(pruned as u64);
            }
            report.outbox += pruned;
        }
        for (name, store) in &self.inboxes {
            let pruned = store.prune_processed(cutoff).await?;
            if pruned > 0 {
                tracing::debug!(service = *name, pruned, "pruned processed inbox records");
                metrics::counter!("inbox_records_pruned_total", "service" => *name)
                    .increment(pruned as u64);
            }
            report.inbox += pruned;
        }
        Ok(report)
    }
}
