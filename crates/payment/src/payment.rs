//! Payment aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{Currency, Money, OrderId, PaymentId, UserId, Version};
use messaging::Entity;

use crate::error::{PaymentError, Result};

/// Unique constraint on the payment's idempotency key (one per order).
pub const ORDER_KEY: &str = "payment_idempotency_key";

/// Payment lifecycle.
///
/// ```text
/// Created ──┬──► Approved ──┬──► Commited
///           │               └──► Released
///           └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Created,
    Approved,
    Commited,
    Failed,
    Released,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Created => "CREATED",
            PaymentStatus::Approved => "APPROVED",
            PaymentStatus::Commited => "COMMITED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Released => "RELEASED",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A payment for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    id: PaymentId,
    order_id: OrderId,
    user_id: UserId,
    idempotency_key: String,
    amount: Money,
    currency: Currency,
    status: PaymentStatus,
    provider_payment_id: Option<String>,
    failure_reason: Option<String>,
    version: Version,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Entity for Payment {
    type Id = PaymentId;
    const NAME: &'static str = "Payment";

    fn id(&self) -> PaymentId {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn unique_keys(&self) -> Vec<(&'static str, String)> {
        vec![(ORDER_KEY, self.idempotency_key.clone())]
    }
}

impl Payment {
    /// Idempotency key of the payment taken for `order_id`.
    pub fn key_for(order_id: OrderId) -> String {
        order_id.to_string()
    }

    pub fn new(
        order_id: OrderId,
        user_id: UserId,
        amount: Money,
        currency: Currency,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            order_id,
            user_id,
            idempotency_key: Self::key_for(order_id),
            amount,
            currency,
            status: PaymentStatus::Created,
            provider_payment_id: None,
            failure_reason: None,
            version: Version::initial(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> PaymentId {
        self.id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn amount(&self) -> Money {
        self.amount
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn status(&self) -> PaymentStatus {
        self.status
    }

    pub fn provider_payment_id(&self) -> Option<&str> {
        self.provider_payment_id.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// CREATED → APPROVED, capturing the provider's id.
    pub fn approve(&mut self, provider_payment_id: String, now: DateTime<Utc>) -> Result<()> {
        self.require(PaymentStatus::Created, "approve")?;
        self.status = PaymentStatus::Approved;
        self.provider_payment_id = Some(provider_payment_id);
        self.updated_at = now;
        Ok(())
    }

    /// CREATED → FAILED.
    pub fn fail(&mut self, reason: String, now: DateTime<Utc>) -> Result<()> {
        self.require(PaymentStatus::Created, "fail")?;
        self.status = PaymentStatus::Failed;
        self.failure_reason = Some(reason);
        self.updated_at = now;
        Ok(())
    }

    /// APPROVED → COMMITED.
    pub fn commit(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require(PaymentStatus::Approved, "commit")?;
        self.status = PaymentStatus::Commited;
        self.updated_at = now;
        Ok(())
    }

    /// APPROVED → RELEASED.
    pub fn release(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require(PaymentStatus::Approved, "release")?;
        self.status = PaymentStatus::Released;
        self.updated_at = now;
        Ok(())
    }

    fn require(&self, status: PaymentStatus, action: &'static str) -> Result<()> {
        if self.status != status {
            return Err(PaymentError::InvalidTransition {
                from: self.status,
                action,
            });
        }
        Ok(())
    }
}
