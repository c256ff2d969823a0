//! Order aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{Currency, Money, OrderId, ProductId, UserId, Version};
use messaging::Entity;

use crate::error::{OrderError, Result};

/// Unique constraint on (user, idempotency key).
pub const ORDER_KEY: &str = "orders_user_idempotency_key";

/// The state of an order.
///
/// ```text
/// Created ──► Paying ──► Paid ──► Completed
///    │          │
///    │          ├──► PaymentFailed
///    └──────────┴──► Fail / Canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[default]
    Created,
    Paying,
    Paid,
    PaymentFailed,
    Completed,
    Fail,
    Canceled,
}

impl OrderStatus {
    /// Returns true if the order can move to `to`.
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, to),
            (Created, Paying | Fail | Canceled)
                | (Paying, Paid | PaymentFailed | Fail | Canceled)
                | (Paid, Completed)
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::PaymentFailed
                | OrderStatus::Completed
                | OrderStatus::Fail
                | OrderStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Paying => "PAYING",
            OrderStatus::Paid => "PAID",
            OrderStatus::PaymentFailed => "PAYMENT_FAILED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Fail => "FAIL",
            OrderStatus::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A line item with the unit price captured at order time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
}

impl OrderItem {
    /// `None` when price times quantity does not fit.
    pub fn line_total(&self) -> Option<Money> {
        self.unit_price.checked_multiply(self.quantity)
    }
}

/// Order aggregate root.
///
/// Items and total are fixed at creation; only the status changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    user_id: UserId,
    idempotency_key: String,
    items: Vec<OrderItem>,
    total_amount: Money,
    currency: Currency,
    status: OrderStatus,
    version: Version,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Entity for Order {
    type Id = OrderId;
    const NAME: &'static str = "Order";

    fn id(&self) -> OrderId {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn unique_keys(&self) -> Vec<(&'static str, String)> {
        vec![(ORDER_KEY, Self::key_for(self.user_id, &self.idempotency_key))]
    }
}

impl Order {
    /// Value of the (user, idempotency key) unique constraint.
    pub fn key_for(user_id: UserId, idempotency_key: &str) -> String {
        format!("{user_id}:{idempotency_key}")
    }

    /// Creates an order; the total is the sum of the line totals.
    pub fn place(
        user_id: UserId,
        idempotency_key: impl Into<String>,
        items: Vec<OrderItem>,
        currency: Currency,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let idempotency_key = idempotency_key.into();
        if idempotency_key.trim().is_empty() {
            return Err(OrderError::InvalidCommand(
                "idempotency key must not be empty".to_string(),
            ));
        }
        if items.is_empty() {
            return Err(OrderError::InvalidCommand(
                "order must have at least one item".to_string(),
            ));
        }
        for item in &items {
            if item.quantity == 0 {
                return Err(OrderError::InvalidCommand(format!(
                    "quantity of {} must be positive",
                    item.product_id
                )));
            }
            if !item.unit_price.is_positive() {
                return Err(OrderError::InvalidCommand(format!(
                    "price of {} must be positive",
                    item.product_id
                )));
            }
        }

        let total_amount = items
            .iter()
            .map(OrderItem::line_total)
            .try_fold(Money::zero(), |total, line| total.checked_add(line?))
            .ok_or_else(|| OrderError::InvalidCommand("order total is out of range".to_string()))?;
        Ok(Self {
            id: OrderId::new(),
            user_id,
            idempotency_key,
            items,
            total_amount,
            currency,
            status: OrderStatus::Created,
            version: Version::initial(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> OrderId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn mark_paying(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(OrderStatus::Paying, now)
    }

    pub fn mark_paid(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(OrderStatus::Paid, now)
    }

    pub fn mark_payment_failed(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(OrderStatus::PaymentFailed, now)
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(OrderStatus::Completed, now)
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(OrderStatus::Fail, now)
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(OrderStatus::Canceled, now)
    }

    fn transition(&mut self, to: OrderStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(OrderError::transition("Order", self.status, to));
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(sku: &str, quantity: u32, cents: i64) -> OrderItem {
        OrderItem {
            product_id: ProductId::new(sku),
            quantity,
            unit_price: Money::from_cents(cents),
        }
    }

    fn usd() -> Currency {
        Currency::parse("USD").unwrap()
    }

    #[test]
    fn total_is_sum_of_line_totals() {
        let order = Order::place(
            UserId::new(),
            "k1",
            vec![item("A", 2, 1000), item("B", 3, 250)],
            usd(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(order.total_amount(), Money::from_cents(2750));
        assert_eq!(order.status(), OrderStatus::Created);
    }

    #[test]
    fn invalid_commands_are_rejected() {
        let user = UserId::new();
        for (key, items) in [
            ("", vec![item("A", 1, 100)]),
            ("k", vec![]),
            ("k", vec![item("A", 0, 100)]),
            ("k", vec![item("A", 1, 0)]),
        ] {
            assert!(matches!(
                Order::place(user, key, items, usd(), Utc::now()),
                Err(OrderError::InvalidCommand(_))
            ));
        }
    }

    #[test]
    fn total_out_of_range_is_an_invalid_command() {
        let user = UserId::new();
        for items in [
            vec![item("A", 3, i64::MAX / 2)],
            vec![item("A", 1, i64::MAX / 2), item("B", 1, i64::MAX / 2), item("C", 1, 2)],
        ] {
            assert!(matches!(
                Order::place(user, "k", items, usd(), Utc::now()),
                Err(OrderError::InvalidCommand(_))
            ));
        }
    }

    #[test]
    fn success_path_transitions() {
        let mut order =
            Order::place(UserId::new(), "k", vec![item("A", 1, 100)], usd(), Utc::now()).unwrap();
        order.mark_paying(Utc::now()).unwrap();
        order.mark_paid(Utc::now()).unwrap();
        order.mark_completed(Utc::now()).unwrap();
        assert!(order.status().is_terminal());
        assert!(order.cancel(Utc::now()).is_err());
    }

    #[test]
    fn cannot_skip_paying() {
        let mut order =
            Order::place(UserId::new(), "k", vec![item("A", 1, 100)], usd(), Utc::now()).unwrap();
        let err = order.mark_paid(Utc::now()).unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition { .. }));
        assert!(order.mark_payment_failed(Utc::now()).is_err());
        order.mark_failed(Utc::now()).unwrap();
        assert_eq!(order.status(), OrderStatus::Fail);
    }

    #[test]
    fn orders_of_different_users_may_share_a_key() {
        let a = Order::place(UserId::new(), "same", vec![item("A", 1, 100)], usd(), Utc::now())
            .unwrap();
        let b = Order::place(UserId::new(), "same", vec![item("A", 1, 100)], usd(), Utc::now())
            .unwrap();
        assert_ne!(a.unique_keys(), b.unique_keys());
    }
}
