//! Catalog price lookup port.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use common::{Currency, Money, ProductId};

use crate::error::Result;

/// Current price of a product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceSnapshot {
    pub product_id: ProductId,
    pub price: Money,
    pub currency: Currency,
}

/// Product catalog owned by the product service.
#[async_trait]
pub trait CatalogPort: Send + Sync {
    /// Prices of the given products. Unknown products are left out.
    async fn price_snapshots(&self, product_ids: &[ProductId]) -> Result<Vec<PriceSnapshot>>;
}

/// In-memory catalog for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    prices: Arc<RwLock<HashMap<ProductId, (Money, Currency)>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`set_price`](Self::set_price).
    pub fn with_price(self, product_id: impl Into<ProductId>, price: Money, currency: Currency) -> Self {
        self.set_price(product_id, price, currency);
        self
    }

    pub fn set_price(&self, product_id: impl Into<ProductId>, price: Money, currency: Currency) {
        self.prices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(product_id.into(), (price, currency));
    }
}

#[async_trait]
impl CatalogPort for InMemoryCatalog {
    async fn price_snapshots(&self, product_ids: &[ProductId]) -> Result<Vec<PriceSnapshot>> {
        let prices = self.prices.read().unwrap_or_else(PoisonError::into_inner);
        Ok(product_ids
            .iter()
            .filter_map(|id| {
                prices.get(id).map(|(price, currency)| PriceSnapshot {
                    product_id: id.clone(),
                    price: *price,
                    currency: currency.clone(),
                })
            })
            .collect())
    }
}
