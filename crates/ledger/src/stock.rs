//! On-hand stock as seen by the ledger.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::StockUnitKey;

use crate::Result;

/// Read-only view of on-hand quantities, owned by the catalog.
///
/// The ledger never decrements these counters.
#[async_trait]
pub trait StockLevels: Send + Sync {
    /// Returns the on-hand quantity for a unit, or `None` if the unit is unknown.
    async fn on_hand(&self, key: &StockUnitKey) -> Result<Option<u32>>;
}

/// In-memory stock levels for tests and benchmarks.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStockLevels {
    levels: Arc<RwLock<HashMap<StockUnitKey, u32>>>,
}

impl InMemoryStockLevels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the on-hand quantity for a unit.
    pub fn set_on_hand(&self, key: StockUnitKey, quantity: u32) {
        self.levels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, quantity);
    }
}

#[async_trait]
impl StockLevels for InMemoryStockLevels {
    async fn on_hand(&self, key: &StockUnitKey) -> Result<Option<u32>> {
        Ok(self
            .levels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied())
    }
}
