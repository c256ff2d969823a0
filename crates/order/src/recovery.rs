//! Finishes saga bootstraps that did not complete at placement time.

use std::sync::Arc;

use common::OrderId;
use messaging::retry::to_chrono;

use crate::error::Result;
use crate::order::{Order, OrderStatus};
use crate::service::OrderService;

/// Outcome of one recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Orders found without a saga.
    pub stalled: usize,
    /// Sagas created by this sweep.
    pub recovered: usize,
    /// Bootstraps that failed again and wait for the next sweep.
    pub failed: usize,
}

/// Scans for placed orders whose saga was never created.
///
/// An order is stalled when it is still `CREATED` or `PAYING`, has no saga
/// row and is older than the configured grace period.
pub struct SagaRecovery {
    service: Arc<OrderService>,
}

impl SagaRecovery {
    pub fn new(service: Arc<OrderService>) -> Self {
        Self { service }
    }

    /// Orders that need their saga bootstrapped, oldest first.
    pub async fn stalled_orders(&self) -> Vec<OrderId> {
        let cutoff = self.service.clock().now() - to_chrono(self.service.config().recovery_grace);
        self.service
            .database()
            .read(|state| {
                let mut stalled: Vec<&Order> = state
                    .orders
                    .values()
                    .filter(|order| {
                        matches!(order.status(), OrderStatus::Created | OrderStatus::Paying)
                            && order.created_at() <= cutoff
                            && state.saga_for(order.id()).is_none()
                    })
                    .collect();
                stalled.sort_by_key(|order| order.created_at());
                stalled.into_iter().map(Order::id).collect()
            })
            .await
    }

    /// Runs one sweep.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> Result<RecoveryReport> {
        let stalled = self.stalled_orders().await;
        let mut report = RecoveryReport {
            stalled: stalled.len(),
            ..RecoveryReport::default()
        };

        for order_id in stalled {
            match self.service.bootstrap_saga(order_id).await {
                Ok(true) => {
                    tracing::info!(%order_id, "recovered saga bootstrap");
                    report.recovered += 1;
                }
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(%order_id, %error, "saga bootstrap failed again");
                    report.failed += 1;
                }
            }
        }

        if report.recovered > 0 {
            metrics::counter!("saga_bootstraps_recovered_total").increment(report.recovered as u64);
        }
        Ok(report)
    }
}
