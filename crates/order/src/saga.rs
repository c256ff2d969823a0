//! Order fulfillment saga.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{OrderId, PaymentId, ReservationId, SagaId, Version};
use messaging::Entity;

use crate::error::{OrderError, Result};

/// Unique constraint making the saga 1:1 with its order.
pub const SAGA_ORDER_KEY: &str = "saga_order_id";

/// The state of a fulfillment saga.
///
/// State transitions:
/// ```text
/// Created ──► InventoryRequested ──► InventoryReserved ──► PaymentRequested
///    │                │                     │                    │
///    │                │                     │                    ▼
///    │                │                     │             PaymentCompleted ──► Completed
///    ▼                ▼                     ▼                    ▼
///    └────────────────┴──────► InventoryReleased ──► Failed ◄────┘
/// ```
///
/// Any non-terminal state may also fail directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    #[default]
    Created,
    InventoryRequested,
    InventoryReserved,
    PaymentRequested,
    PaymentCompleted,
    Completed,
    InventoryReleased,
    Failed,
}

impl SagaStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Failed)
    }

    /// Returns true once the saga has branched into compensation.
    pub fn is_compensating(&self) -> bool {
        matches!(self, SagaStatus::InventoryReleased | SagaStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Created => "CREATED",
            SagaStatus::InventoryRequested => "INVENTORY_REQUESTED",
            SagaStatus::InventoryReserved => "INVENTORY_RESERVED",
            SagaStatus::PaymentRequested => "PAYMENT_REQUESTED",
            SagaStatus::PaymentCompleted => "PAYMENT_COMPLETED",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::InventoryReleased => "INVENTORY_RELEASED",
            SagaStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One saga per order, tracking where fulfillment stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Saga {
    id: SagaId,
    order_id: OrderId,
    reservation_id: Option<ReservationId>,
    payment_id: Option<PaymentId>,
    status: SagaStatus,
    inventory_requested_at: Option<DateTime<Utc>>,
    inventory_reserved_at: Option<DateTime<Utc>>,
    inventory_released_at: Option<DateTime<Utc>>,
    payment_requested_at: Option<DateTime<Utc>>,
    payment_completed_at: Option<DateTime<Utc>>,
    payment_released_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    fail_reason: Option<String>,
    version: Version,
    created_at: DateTime<Utc>,
}

impl Entity for Saga {
    type Id = SagaId;
    const NAME: &'static str = "Saga";

    fn id(&self) -> SagaId {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn unique_keys(&self) -> Vec<(&'static str, String)> {
        vec![(SAGA_ORDER_KEY, self.order_id.to_string())]
    }
}

impl Saga {
    /// A new saga in `Created`.
    pub fn create(order_id: OrderId, now: DateTime<Utc>) -> Self {
        Self {
            id: SagaId::new(),
            order_id,
            reservation_id: None,
            payment_id: None,
            status: SagaStatus::Created,
            inventory_requested_at: None,
            inventory_reserved_at: None,
            inventory_released_at: None,
            payment_requested_at: None,
            payment_completed_at: None,
            payment_released_at: None,
            completed_at: None,
            failed_at: None,
            fail_reason: None,
            version: Version::initial(),
            created_at: now,
        }
    }

    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn reservation_id(&self) -> Option<ReservationId> {
        self.reservation_id
    }

    pub fn payment_id(&self) -> Option<PaymentId> {
        self.payment_id
    }

    pub fn fail_reason(&self) -> Option<&str> {
        self.fail_reason.as_deref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn inventory_released_at(&self) -> Option<DateTime<Utc>> {
        self.inventory_released_at
    }

    pub fn payment_requested_at(&self) -> Option<DateTime<Utc>> {
        self.payment_requested_at
    }

    pub fn payment_released_at(&self) -> Option<DateTime<Utc>> {
        self.payment_released_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.failed_at
    }

    /// CREATED → INVENTORY_REQUESTED.
    pub fn mark_inventory_requested(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.advance(&[SagaStatus::Created], SagaStatus::InventoryRequested)?;
        self.inventory_requested_at = Some(now);
        Ok(())
    }

    /// {CREATED, INVENTORY_REQUESTED} → INVENTORY_RESERVED.
    pub fn mark_inventory_reserved(
        &mut self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.advance(
            &[SagaStatus::Created, SagaStatus::InventoryRequested],
            SagaStatus::InventoryReserved,
        )?;
        self.reservation_id = Some(reservation_id);
        self.inventory_reserved_at = Some(now);
        Ok(())
    }

    /// INVENTORY_RESERVED → PAYMENT_REQUESTED.
    pub fn mark_payment_requested(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.advance(&[SagaStatus::InventoryReserved], SagaStatus::PaymentRequested)?;
        self.payment_requested_at = Some(now);
        Ok(())
    }

    /// PAYMENT_REQUESTED → PAYMENT_COMPLETED.
    pub fn mark_payment_completed(&mut self, payment_id: PaymentId, now: DateTime<Utc>) -> Result<()> {
        self.advance(&[SagaStatus::PaymentRequested], SagaStatus::PaymentCompleted)?;
        self.payment_id = Some(payment_id);
        self.payment_completed_at = Some(now);
        Ok(())
    }

    /// Any non-terminal state except INVENTORY_RELEASED → INVENTORY_RELEASED.
    ///
    /// This is the single branch into compensation.
    pub fn mark_inventory_released(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() || self.status == SagaStatus::InventoryReleased {
            return Err(self.invalid(SagaStatus::InventoryReleased));
        }
        self.set_status(SagaStatus::InventoryReleased);
        self.inventory_released_at = Some(now);
        self.fail_reason.get_or_insert_with(|| reason.into());
        Ok(())
    }

    /// PAYMENT_COMPLETED → COMPLETED.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.advance(&[SagaStatus::PaymentCompleted], SagaStatus::Completed)?;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Any non-terminal state → FAILED. Keeps an earlier fail reason.
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid(SagaStatus::Failed));
        }
        self.set_status(SagaStatus::Failed);
        self.failed_at = Some(now);
        self.fail_reason.get_or_insert_with(|| reason.into());
        Ok(())
    }

    /// Records a payment that has to be given back because it completed after
    /// the saga started compensating. The status does not change.
    pub fn record_payment_released(&mut self, payment_id: PaymentId, now: DateTime<Utc>) -> Result<()> {
        if !self.status.is_compensating() {
            return Err(self.invalid("PAYMENT_RELEASED"));
        }
        self.payment_id = Some(payment_id);
        self.payment_released_at = Some(now);
        Ok(())
    }

    /// Remembers which payment failed.
    pub fn record_payment(&mut self, payment_id: PaymentId) {
        self.payment_id = Some(payment_id);
    }

    fn advance(&mut self, from: &[SagaStatus], to: SagaStatus) -> Result<()> {
        if !from.contains(&self.status) {
            return Err(self.invalid(to));
        }
        self.set_status(to);
        Ok(())
    }

    fn set_status(&mut self, to: SagaStatus) {
        tracing::debug!(order_id = %self.order_id, from = %self.status, %to, "saga transition");
        metrics::counter!("saga_transitions_total", "to" => to.as_str()).increment(1);
        self.status = to;
    }

    fn invalid(&self, to: impl ToString) -> OrderError {
        OrderError::transition("Saga", self.status, to)
    }
}
