//! 缺货级联传播
//!
//! A kitchen device marks an item out of stock; the mark cascades into
//! every active order that still carries the item, then propagates to
//! peers. Local-first: the record is persisted and applied before any
//! broadcast, and a failed broadcast never rolls the local state back.
//!
//! Marking an item available again only lifts the mark for future
//! orders; quantities already withdrawn are not restored.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shared::message::SyncMessage;
use shared::order::{recalculate_totals, LineStatus, Order};
use shared::stock::{OriginContext, OutOfStockRecord, Withdraw};
use shared::util::now_millis;
use std::sync::Arc;

use crate::cache::OrderCache;
use crate::engine::ReconcileEngine;
use crate::utils::SyncResult;

/// Out-of-stock mark propagator
pub struct StockPropagator {
    tenant_id: String,
    engine: Arc<ReconcileEngine>,
    cache: Arc<dyn OrderCache>,
    /// Active marks, keyed by the case-insensitive item name
    active: DashMap<String, OutOfStockRecord>,
}

impl StockPropagator {
    pub fn new(
        tenant_id: impl Into<String>,
        engine: Arc<ReconcileEngine>,
        cache: Arc<dyn OrderCache>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            engine,
            cache,
            active: DashMap::new(),
        }
    }

    /// Mark an item out of stock and cascade through active orders
    ///
    /// Returns `Ok(None)` if the item is already marked — at most one
    /// active record per item.
    pub async fn mark_unavailable(
        &self,
        item_name: &str,
        withdraw: Withdraw,
        origin: Option<OriginContext>,
        marked_by: Option<String>,
    ) -> SyncResult<Option<OutOfStockRecord>> {
        let key = item_name.to_lowercase();
        let record = OutOfStockRecord::new(item_name, withdraw, origin, marked_by);

        // Check-and-insert under the entry lock, so two racing marks
        // for the same item cannot both pass the guard
        match self.active.entry(key.clone()) {
            Entry::Occupied(_) => {
                tracing::warn!(target: "stock", item = item_name, "Item already marked out of stock");
                return Ok(None);
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }

        if let Err(e) = self.cache.upsert_stock(&self.tenant_id, &record).await {
            // Roll the reservation back so a retry can succeed
            self.active.remove(&key);
            return Err(e);
        }

        tracing::info!(
            target: "stock",
            item = %record.item_name,
            withdraw = ?record.withdraw,
            "Item marked out of stock"
        );

        self.cascade(&record).await;

        // Best-effort: peers catch up via poll/sync_state if this fails
        self.engine
            .broadcast(SyncMessage::StockUpdate {
                record: record.clone(),
            });

        Ok(Some(record))
    }

    /// Lift an out-of-stock mark by record id
    ///
    /// Withdrawn quantities stay withdrawn; only future orders see the
    /// item again. `Ok(None)` if no active mark carries the id.
    pub async fn mark_available(&self, record_id: &str) -> SyncResult<Option<OutOfStockRecord>> {
        let key = self
            .active
            .iter()
            .find(|e| e.value().id == record_id)
            .map(|e| e.key().clone());
        let Some(key) = key else {
            tracing::warn!(target: "stock", record_id, "No active mark to lift");
            return Ok(None);
        };
        let Some((_, mut record)) = self.active.remove(&key) else {
            return Ok(None);
        };

        record.active = false;
        self.cache.upsert_stock(&self.tenant_id, &record).await?;

        tracing::info!(target: "stock", item = %record.item_name, "Out-of-stock mark lifted");

        self.engine.broadcast(SyncMessage::StockUpdate {
            record: record.clone(),
        });

        Ok(Some(record))
    }

    /// Apply a mark received from a peer or the cloud
    ///
    /// Same cascade as a local mark, but never re-broadcast — the sender
    /// already fanned it out.
    pub async fn apply_remote(&self, record: OutOfStockRecord) {
        let key = record.match_key();

        if !record.active {
            self.active.remove(&key);
            if let Err(e) = self.cache.upsert_stock(&self.tenant_id, &record).await {
                tracing::error!(target: "stock", "Cache write failed: {e}");
            }
            tracing::info!(target: "stock", item = %record.item_name, "Remote mark lifted");
            return;
        }

        // Re-delivery of a mark we already hold is a no-op
        if let Some(existing) = self.active.get(&key) {
            if existing.id == record.id {
                return;
            }
        }

        if let Err(e) = self.cache.upsert_stock(&self.tenant_id, &record).await {
            tracing::error!(target: "stock", "Cache write failed: {e}");
        }
        self.active.insert(key, record.clone());

        tracing::info!(target: "stock", item = %record.item_name, "Remote out-of-stock mark applied");

        self.cascade(&record).await;
    }

    /// Warm active marks from the durable cache at startup
    pub async fn load_from_cache(&self) -> SyncResult<usize> {
        let records = self.cache.get_stock(&self.tenant_id).await?;
        let mut count = 0;
        for record in records {
            if record.active {
                self.active.insert(record.match_key(), record);
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn active_records(&self) -> Vec<OutOfStockRecord> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    pub fn is_unavailable(&self, item_name: &str) -> bool {
        self.active.contains_key(&item_name.to_lowercase())
    }

    /// Withdraw the item from every active order that carries it
    async fn cascade(&self, record: &OutOfStockRecord) {
        for mut order in self.engine.active_orders() {
            if apply_withdrawal(&mut order, record) {
                tracing::info!(
                    target: "stock",
                    order_id = %order.id,
                    item = %record.item_name,
                    "Order adjusted after out-of-stock mark"
                );
                self.engine.observe(order).await;
            }
        }
    }
}

/// Withdraw matching lines from one order; true if anything changed
///
/// Quantities clamp at zero and the line is kept, so staff can see what
/// was withdrawn. A line that reaches zero is marked fulfilled — it no
/// longer represents outstanding kitchen work.
fn apply_withdrawal(order: &mut Order, record: &OutOfStockRecord) -> bool {
    let key = record.match_key();
    let mut changed = false;

    for line in &mut order.items {
        if line.name.to_lowercase() != key || line.quantity == 0 {
            continue;
        }
        let reduce = match record.withdraw {
            Withdraw::Quantity(q) => q as i32,
            Withdraw::All => line.quantity,
        };
        let new_quantity = (line.quantity - reduce).max(0);
        if new_quantity != line.quantity {
            line.quantity = new_quantity;
            changed = true;
        }
        if line.quantity == 0 {
            line.status = LineStatus::Fulfilled;
        }
    }

    if changed {
        recalculate_totals(order);
        // The clock may not have ticked since the last write; force the
        // revision forward so the merge is not discarded as a tie
        order.updated_at = now_millis().max(order.updated_at + 1);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use shared::order::{Channel, OrderLine};

    fn setup() -> (Arc<ReconcileEngine>, Arc<MemoryCache>, StockPropagator) {
        let cache = Arc::new(MemoryCache::new());
        let engine = Arc::new(ReconcileEngine::new("t-1", cache.clone()));
        let propagator = StockPropagator::new("t-1", engine.clone(), cache.clone());
        (engine, cache, propagator)
    }

    fn order_with(id: &str, lines: Vec<OrderLine>) -> Order {
        Order::new(id, "5", Channel::Pos, lines)
    }

    #[tokio::test]
    async fn test_duplicate_mark_rejected() {
        let (_, _, propagator) = setup();

        let first = propagator
            .mark_unavailable("Rasam", Withdraw::All, None, None)
            .await
            .unwrap();
        assert!(first.is_some());

        // Case-insensitive duplicate guard
        let second = propagator
            .mark_unavailable("RASAM", Withdraw::All, None, None)
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(propagator.active_records().len(), 1);
    }

    #[tokio::test]
    async fn test_racing_marks_yield_one_record() {
        let (_, _, propagator) = setup();

        // Both calls are in flight at once; exactly one may win
        let (a, b) = tokio::join!(
            propagator.mark_unavailable("Rasam", Withdraw::All, None, None),
            propagator.mark_unavailable("rasam", Withdraw::All, None, None),
        );
        let accepted = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|r| r.is_some())
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(propagator.active_records().len(), 1);
    }

    #[tokio::test]
    async fn test_cascade_clamps_and_fulfills() {
        let (engine, _, propagator) = setup();
        engine
            .observe(order_with(
                "A",
                vec![
                    OrderLine::new("Rasam", 2, 3.0),
                    OrderLine::new("Dosa", 1, 4.5),
                ],
            ))
            .await;

        propagator
            .mark_unavailable("rasam", Withdraw::Quantity(5), None, None)
            .await
            .unwrap();

        let adjusted = engine.get("A").unwrap();
        // Withdrawing 5 from 2 clamps at zero, keeps the line
        assert_eq!(adjusted.items[0].quantity, 0);
        assert_eq!(adjusted.items[0].status, LineStatus::Fulfilled);
        // The other line is untouched and totals reflect it alone
        assert_eq!(adjusted.items[1].quantity, 1);
        assert_eq!(adjusted.total, 4.5);
    }

    #[tokio::test]
    async fn test_partial_withdrawal() {
        let (engine, _, propagator) = setup();
        engine
            .observe(order_with("A", vec![OrderLine::new("Vada", 3, 2.0)]))
            .await;

        propagator
            .mark_unavailable("Vada", Withdraw::Quantity(1), None, None)
            .await
            .unwrap();

        let adjusted = engine.get("A").unwrap();
        assert_eq!(adjusted.items[0].quantity, 2);
        assert_eq!(adjusted.items[0].status, LineStatus::Pending);
        assert_eq!(adjusted.total, 4.0);
    }

    #[tokio::test]
    async fn test_mark_available_does_not_restore() {
        let (engine, _, propagator) = setup();
        engine
            .observe(order_with("A", vec![OrderLine::new("Idli", 2, 3.0)]))
            .await;

        let record = propagator
            .mark_unavailable("Idli", Withdraw::All, None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(engine.get("A").unwrap().items[0].quantity, 0);

        let lifted = propagator.mark_available(&record.id).await.unwrap();
        assert!(lifted.is_some());
        assert!(!lifted.unwrap().active);
        assert!(!propagator.is_unavailable("Idli"));

        // Withdrawn quantities stay withdrawn
        assert_eq!(engine.get("A").unwrap().items[0].quantity, 0);
    }

    #[tokio::test]
    async fn test_apply_remote_idempotent() {
        let (engine, _, propagator) = setup();
        engine
            .observe(order_with("A", vec![OrderLine::new("Thali", 1, 9.0)]))
            .await;

        let record = OutOfStockRecord::new("Thali", Withdraw::All, None, None);
        propagator.apply_remote(record.clone()).await;
        assert_eq!(engine.get("A").unwrap().items[0].quantity, 0);
        assert!(propagator.is_unavailable("thali"));

        // Same record delivered twice (push + poll overlap)
        propagator.apply_remote(record).await;
        assert_eq!(propagator.active_records().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_orders_untouched() {
        let (engine, _, propagator) = setup();
        let mut done = order_with("A", vec![OrderLine::new("Rasam", 2, 3.0)]);
        done.status = shared::order::OrderStatus::Completed;
        engine.observe(done).await;

        propagator
            .mark_unavailable("Rasam", Withdraw::All, None, None)
            .await
            .unwrap();

        assert_eq!(engine.get("A").unwrap().items[0].quantity, 2);
    }

    #[tokio::test]
    async fn test_mark_persisted_before_broadcast() {
        let (_, cache, propagator) = setup();
        propagator
            .mark_unavailable("Rasam", Withdraw::All, None, None)
            .await
            .unwrap();

        let stored = cache.get_stock("t-1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].active);
    }
}
