//! Durable local cache seam
//!
//! The cache is an external collaborator (a tenant-scoped store owned by
//! the surrounding application) consumed through the [`OrderCache`]
//! trait. It is the only resource mutated by more than one component
//! (the engine and the stock propagator); implementations must make
//! "read record, compute, write" effectively atomic per id.

use async_trait::async_trait;
use dashmap::DashMap;
use shared::order::Order;
use shared::stock::OutOfStockRecord;
use std::collections::HashMap;

use crate::utils::SyncResult;

/// Tenant-scoped durable store of orders and out-of-stock records
#[async_trait]
pub trait OrderCache: Send + Sync + std::fmt::Debug {
    /// All cached orders for a tenant
    async fn get_orders(&self, tenant_id: &str) -> SyncResult<Vec<Order>>;

    /// Insert or replace an order record
    async fn upsert_order(&self, tenant_id: &str, order: &Order) -> SyncResult<()>;

    /// Remove an order (explicit completion/cancellation archival only,
    /// never eviction)
    async fn delete_order(&self, tenant_id: &str, order_id: &str) -> SyncResult<()>;

    /// All cached out-of-stock records for a tenant
    async fn get_stock(&self, tenant_id: &str) -> SyncResult<Vec<OutOfStockRecord>>;

    /// Insert or replace an out-of-stock record
    async fn upsert_stock(&self, tenant_id: &str, record: &OutOfStockRecord) -> SyncResult<()>;
}

/// In-memory cache, used by tests and demos
///
/// Per-tenant maps live behind a `DashMap` entry, so concurrent writes
/// to the same id serialize on the tenant shard while different tenants
/// proceed independently.
#[derive(Debug, Default)]
pub struct MemoryCache {
    orders: DashMap<String, HashMap<String, Order>>,
    stock: DashMap<String, HashMap<String, OutOfStockRecord>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderCache for MemoryCache {
    async fn get_orders(&self, tenant_id: &str) -> SyncResult<Vec<Order>> {
        Ok(self
            .orders
            .get(tenant_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_order(&self, tenant_id: &str, order: &Order) -> SyncResult<()> {
        self.orders
            .entry(tenant_id.to_string())
            .or_default()
            .insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn delete_order(&self, tenant_id: &str, order_id: &str) -> SyncResult<()> {
        if let Some(mut m) = self.orders.get_mut(tenant_id) {
            m.remove(order_id);
        }
        Ok(())
    }

    async fn get_stock(&self, tenant_id: &str) -> SyncResult<Vec<OutOfStockRecord>> {
        Ok(self
            .stock
            .get(tenant_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_stock(&self, tenant_id: &str, record: &OutOfStockRecord) -> SyncResult<()> {
        self.stock
            .entry(tenant_id.to_string())
            .or_default()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::order::{Channel, OrderLine};

    #[tokio::test]
    async fn test_memory_cache_tenant_scoping() {
        let cache = MemoryCache::new();
        let order = Order::new(
            "o-1",
            "1",
            Channel::Pos,
            vec![OrderLine::new("Dosa", 1, 4.5)],
        );

        cache.upsert_order("tenant-a", &order).await.unwrap();
        assert_eq!(cache.get_orders("tenant-a").await.unwrap().len(), 1);
        assert!(cache.get_orders("tenant-b").await.unwrap().is_empty());

        cache.delete_order("tenant-a", "o-1").await.unwrap();
        assert!(cache.get_orders("tenant-a").await.unwrap().is_empty());
    }
}
