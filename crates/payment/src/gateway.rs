//! Payment gateway port and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use common::{Currency, Money, OrderId, UserId};

use crate::error::{PaymentError, Result};

/// What the provider is asked to authorize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    /// Lets the provider recognise a retried request.
    pub idempotency_key: String,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub amount: Money,
    pub currency: Currency,
}

/// The provider's answer. A decline is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Approved { provider_payment_id: String },
    Declined { reason: String },
}

/// External payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Authorizes a charge. Repeating a request with the same idempotency key
    /// returns the original answer.
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<Authorization>;

    /// Captures a previously approved authorization.
    async fn capture(&self, provider_payment_id: &str) -> Result<()>;

    /// Voids a previously approved authorization.
    async fn void(&self, provider_payment_id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct GatewayState {
    decisions: HashMap<String, Authorization>,
    captured: Vec<String>,
    voided: Vec<String>,
    next_id: u32,
    decline_next: u32,
    limit: Option<Money>,
    unavailable: bool,
}

/// In-memory gateway for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declines the next `count` new authorizations.
    pub fn decline_next(&self, count: u32) {
        self.lock().decline_next = count;
    }

    /// Declines any authorization above `limit`.
    pub fn set_limit(&self, limit: Option<Money>) {
        self.lock().limit = limit;
    }

    /// Makes every call fail with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Number of distinct authorizations answered.
    pub fn authorization_count(&self) -> usize {
        self.lock().decisions.len()
    }

    pub fn captured(&self) -> Vec<String> {
        self.lock().captured.clone()
    }

    pub fn voided(&self) -> Vec<String> {
        self.lock().voided.clone()
    }

    fn lock(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_available(state: &GatewayState) -> Result<()> {
    if state.unavailable {
        return Err(PaymentError::GatewayUnavailable(
            "provider did not respond".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn authorize(&self, request: &AuthorizationRequest) -> Result<Authorization> {
        let mut state = self.lock();
        check_available(&state)?;
        if let Some(previous) = state.decisions.get(&request.idempotency_key) {
            return Ok(previous.clone());
        }

        let decision = if !request.amount.is_positive() {
            Authorization::Declined {
                reason: format!("invalid amount {}", request.amount),
            }
        } else if state.limit.is_some_and(|limit| request.amount > limit) {
            Authorization::Declined {
                reason: "amount exceeds limit".to_string(),
            }
        } else if state.decline_next > 0 {
            state.decline_next -= 1;
            Authorization::Declined {
                reason: "card declined".to_string(),
            }
        } else {
            state.next_id += 1;
            Authorization::Approved {
                provider_payment_id: format!("PAY-{:04}", state.next_id),
            }
        };
        state
            .decisions
            .insert(request.idempotency_key.clone(), decision.clone());
        Ok(decision)
    }

    async fn capture(&self, provider_payment_id: &str) -> Result<()> {
        let mut state = self.lock();
        check_available(&state)?;
        state.captured.push(provider_payment_id.to_string());
        Ok(())
    }

    async fn void(&self, provider_payment_id: &str) -> Result<()> {
        let mut state = self.lock();
        check_available(&state)?;
        state.voided.push(provider_payment_id.to_string());
        Ok(())
    }
}
