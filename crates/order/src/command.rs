//! Commands accepted by the order service.

use common::{Currency, Money, ProductId, UserId};

/// A requested line item, before prices are looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl OrderLine {
    pub fn new(product_id: impl Into<ProductId>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// Places an order for a user.
///
/// The client sends the total it expects to pay; it must match the total
/// computed from current catalog prices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceOrder {
    pub user_id: UserId,
    pub idempotency_key: String,
    pub items: Vec<OrderLine>,
    pub total_amount: Money,
    pub currency: Currency,
}

impl PlaceOrder {
    /// Rejects input that no catalog lookup can fix.
    pub fn validate(&self) -> Result<(), String> {
        if self.idempotency_key.trim().is_empty() {
            return Err("idempotency key must not be empty".to_string());
        }
        if self.items.is_empty() {
            return Err("order must have at least one item".to_string());
        }
        if let Some(line) = self.items.iter().find(|line| line.quantity == 0) {
            return Err(format!("quantity of {} must be positive", line.product_id));
        }
        if !self.total_amount.is_positive() {
            return Err("total amount must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> PlaceOrder {
        PlaceOrder {
            user_id: UserId::new(),
            idempotency_key: "key-1".to_string(),
            items: vec![OrderLine::new("A", 1)],
            total_amount: Money::from_cents(100),
            currency: Currency::parse("USD").unwrap(),
        }
    }

    #[test]
    fn accepts_well_formed_command() {
        assert!(command().validate().is_ok());
    }

    #[test]
    fn rejects_blank_key_empty_items_zero_quantity_and_zero_total() {
        let mut blank = command();
        blank.idempotency_key = "  ".to_string();
        let mut empty = command();
        empty.items.clear();
        let mut zero_qty = command();
        zero_qty.items = vec![OrderLine::new("A", 0)];
        let mut zero_total = command();
        zero_total.total_amount = Money::zero();

        for cmd in [blank, empty, zero_qty, zero_total] {
            assert!(cmd.validate().is_err());
        }
    }
}
