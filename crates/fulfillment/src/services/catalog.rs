//! Catalog collaborator trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::StockUnitKey;
use ledger::{LedgerError, StockLevels};
use tokio::sync::RwLock;

use crate::error::ServiceError;

/// Current catalog state of one stock unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub product_name: String,
    pub is_active: bool,
    pub stock_quantity: u32,
}

/// Read access to product activity and on-hand stock.
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Returns the current entry for a stock unit, or `None` if it does not exist.
    async fn stock_snapshot(&self, key: &StockUnitKey)
    -> Result<Option<CatalogEntry>, ServiceError>;
}

#[async_trait]
impl<T: CatalogService + ?Sized> CatalogService for Arc<T> {
    async fn stock_snapshot(
        &self,
        key: &StockUnitKey,
    ) -> Result<Option<CatalogEntry>, ServiceError> {
        (**self).stock_snapshot(key).await
    }
}

/// Exposes a catalog's on-hand quantities to the reservation ledger.
#[derive(Debug, Clone)]
pub struct CatalogStockLevels<C>(pub C);

#[async_trait]
impl<C: CatalogService> StockLevels for CatalogStockLevels<C> {
    async fn on_hand(&self, key: &StockUnitKey) -> ledger::Result<Option<u32>> {
        let entry = self
            .0
            .stock_snapshot(key)
            .await
            .map_err(|e| LedgerError::StockLookup(e.to_string()))?;
        Ok(entry.map(|e| e.stock_quantity))
    }
}

/// In-memory catalog for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    entries: Arc<RwLock<HashMap<StockUnitKey, CatalogEntry>>>,
    fail_on_lookup: Arc<AtomicBool>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an active stock unit.
    pub async fn add_unit(&self, key: StockUnitKey, name: impl Into<String>, stock: u32) {
        self.entries.write().await.insert(
            key,
            CatalogEntry {
                product_name: name.into(),
                is_active: true,
                stock_quantity: stock,
            },
        );
    }

    pub async fn set_active(&self, key: StockUnitKey, active: bool) {
        if let Some(entry) = self.entries.write().await.get_mut(&key) {
            entry.is_active = active;
        }
    }

    pub async fn set_stock(&self, key: StockUnitKey, stock: u32) {
        if let Some(entry) = self.entries.write().await.get_mut(&key) {
            entry.stock_quantity = stock;
        }
    }

    /// Configures lookups to fail.
    pub fn set_fail_on_lookup(&self, fail: bool) {
        self.fail_on_lookup.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CatalogService for InMemoryCatalog {
    async fn stock_snapshot(
        &self,
        key: &StockUnitKey,
    ) -> Result<Option<CatalogEntry>, ServiceError> {
        if self.fail_on_lookup.load(Ordering::SeqCst) {
            return Err(ServiceError::Timeout);
        }
        Ok(self.entries.read().await.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use common::ProductId;

    use super::*;

    #[tokio::test]
    async fn test_stock_levels_adapter() {
        let catalog = InMemoryCatalog::new();
        let key = StockUnitKey::new(ProductId::new(), 1, 1);
        catalog.add_unit(key, "Linen shirt", 8).await;
        let levels = CatalogStockLevels(catalog.clone());

        assert_eq!(levels.on_hand(&key).await.unwrap(), Some(8));
        assert_eq!(
            levels
                .on_hand(&StockUnitKey::new(ProductId::new(), 1, 1))
                .await
                .unwrap(),
            None
        );

        catalog.set_fail_on_lookup(true);
        assert!(matches!(
            levels.on_hand(&key).await,
            Err(LedgerError::StockLookup(_))
        ));
    }
}
