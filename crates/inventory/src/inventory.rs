//! Inventory aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{InventoryId, ProductId, Version};
use messaging::Entity;

use crate::error::{InventoryError, Result};

/// Unique constraint on the product column.
pub const PRODUCT_KEY: &str = "inventory_product_id";

/// Sellability of a stock row.
///
/// ```text
/// Available ◄──► Unavailable
///     │               │
///     └──► Deleted ◄──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InventoryStatus {
    #[default]
    Available,
    Unavailable,
    /// Terminal.
    Deleted,
}

impl InventoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InventoryStatus::Available => "AVAILABLE",
            InventoryStatus::Unavailable => "UNAVAILABLE",
            InventoryStatus::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for InventoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stock for one product.
///
/// Reserving moves units from available to reserved; confirming a reservation
/// removes them from reserved; releasing moves them back to available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    id: InventoryId,
    product_id: ProductId,
    available_quantity: u32,
    reserved_quantity: u32,
    status: InventoryStatus,
    version: Version,
    updated_at: DateTime<Utc>,
}

impl Entity for Inventory {
    type Id = InventoryId;
    const NAME: &'static str = "Inventory";

    fn id(&self) -> InventoryId {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn unique_keys(&self) -> Vec<(&'static str, String)> {
        vec![(PRODUCT_KEY, self.product_id.to_string())]
    }
}

impl Inventory {
    /// New stock row with `available` sellable units.
    pub fn new(product_id: ProductId, available: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: InventoryId::new(),
            product_id,
            available_quantity: available,
            reserved_quantity: 0,
            status: InventoryStatus::Available,
            version: Version::initial(),
            updated_at: now,
        }
    }

    pub fn id(&self) -> InventoryId {
        self.id
    }

    pub fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    pub fn available_quantity(&self) -> u32 {
        self.available_quantity
    }

    pub fn reserved_quantity(&self) -> u32 {
        self.reserved_quantity
    }

    pub fn status(&self) -> InventoryStatus {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns an error unless `quantity` units could be reserved right now.
    pub fn check_reservable(&self, quantity: u32) -> Result<()> {
        positive(quantity)?;
        if self.status != InventoryStatus::Available {
            return Err(InventoryError::transition(
                "Inventory",
                self.status,
                "RESERVED",
            ));
        }
        if self.available_quantity < quantity {
            return Err(self.insufficient(quantity, self.available_quantity));
        }
        Ok(())
    }

    /// Moves `quantity` units from available to reserved.
    pub fn reserve(&mut self, quantity: u32, now: DateTime<Utc>) -> Result<()> {
        self.check_reservable(quantity)?;
        self.reserved_quantity = self
            .reserved_quantity
            .checked_add(quantity)
            .ok_or(InventoryError::InvalidQuantity { quantity })?;
        self.available_quantity -= quantity;
        self.updated_at = now;
        Ok(())
    }

    /// Confirms `quantity` reserved units as sold.
    pub fn process_reserved(&mut self, quantity: u32, now: DateTime<Utc>) -> Result<()> {
        positive(quantity)?;
        if self.reserved_quantity < quantity {
            return Err(self.insufficient(quantity, self.reserved_quantity));
        }
        self.reserved_quantity -= quantity;
        self.updated_at = now;
        Ok(())
    }

    /// Returns `quantity` reserved units to available.
    pub fn release(&mut self, quantity: u32, now: DateTime<Utc>) -> Result<()> {
        positive(quantity)?;
        if self.reserved_quantity < quantity {
            return Err(self.insufficient(quantity, self.reserved_quantity));
        }
        self.available_quantity = self
            .available_quantity
            .checked_add(quantity)
            .ok_or(InventoryError::InvalidQuantity { quantity })?;
        self.reserved_quantity -= quantity;
        self.updated_at = now;
        Ok(())
    }

    /// Restocks.
    pub fn increase(&mut self, amount: u32, now: DateTime<Utc>) -> Result<()> {
        positive(amount)?;
        self.available_quantity = self
            .available_quantity
            .checked_add(amount)
            .ok_or(InventoryError::InvalidQuantity { quantity: amount })?;
        self.updated_at = now;
        Ok(())
    }

    /// Removes sellable units, e.g. after a stock count.
    pub fn decrease(&mut self, amount: u32, now: DateTime<Utc>) -> Result<()> {
        positive(amount)?;
        if self.available_quantity < amount {
            return Err(self.insufficient(amount, self.available_quantity));
        }
        self.available_quantity -= amount;
        self.updated_at = now;
        Ok(())
    }

    /// Changes status. Self-transitions and leaving `Deleted` are rejected.
    pub fn change_status(&mut self, to: InventoryStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status == to || self.status == InventoryStatus::Deleted {
            return Err(InventoryError::transition("Inventory", self.status, to));
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    fn insufficient(&self, requested: u32, available: u32) -> InventoryError {
        InventoryError::InsufficientInventory {
            inventory_id: self.id,
            requested,
            available,
        }
    }
}

fn positive(quantity: u32) -> Result<()> {
    if quantity == 0 {
        return Err(InventoryError::InvalidQuantity { quantity });
    }
    Ok(())
}
