//! Convergence scenarios across redundant transports

use ordersync::cache::{MemoryCache, OrderCache};
use ordersync::engine::{MergeOutcome, ReconcileEngine};
use ordersync::SyncResult;
use shared::message::SyncMessage;
use shared::order::{Channel, Order, OrderLine, OrderStatus};
use shared::stock::OutOfStockRecord;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn engine_with_cache() -> (Arc<ReconcileEngine>, Arc<MemoryCache>) {
    let cache = Arc::new(MemoryCache::new());
    (
        Arc::new(ReconcileEngine::new("t-1", cache.clone())),
        cache,
    )
}

fn order(id: &str, status: OrderStatus, updated_at: i64) -> Order {
    let mut o = Order::new(
        id,
        "12",
        Channel::Online,
        vec![OrderLine::new("Masala Dosa", 1, 6.0)],
    );
    o.status = status;
    o.updated_at = updated_at;
    o
}

#[tokio::test]
async fn test_duplicate_delivery_is_idempotent() {
    // The same order arrives via push, then again via poll, then again
    // inside a state snapshot — one canonical record, no churn
    let (engine, cache) = engine_with_cache();
    let o = order("A", OrderStatus::Pending, 100);

    engine
        .observe_message(SyncMessage::order_created(o.clone()))
        .await;
    assert_eq!(engine.observe(o.clone()).await, MergeOutcome::Unchanged);
    engine
        .observe_message(SyncMessage::SyncState {
            active_orders: vec![o],
            recent_orders: vec![],
        })
        .await;

    assert_eq!(engine.active_orders().len(), 1);
    assert_eq!(cache.get_orders("t-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_merge_is_order_independent() {
    // Two devices see the same two revisions in opposite arrival order
    // and still converge on the same state
    let (first, _) = engine_with_cache();
    let (second, _) = engine_with_cache();

    let early = order("A", OrderStatus::Confirmed, 100);
    let late = order("A", OrderStatus::Preparing, 200);

    first.observe(early.clone()).await;
    first.observe(late.clone()).await;

    second.observe(late).await;
    second.observe(early).await;

    assert_eq!(first.get("A"), second.get("A"));
    assert_eq!(first.get("A").unwrap().status, OrderStatus::Preparing);
}

#[tokio::test]
async fn test_terminal_lock_survives_late_revisions() {
    let (engine, _) = engine_with_cache();

    engine.observe(order("A", OrderStatus::Preparing, 100)).await;
    engine.observe(order("A", OrderStatus::Cancelled, 200)).await;

    // A straggler with a newer clock still cannot reopen it
    let outcome = engine.observe(order("A", OrderStatus::Ready, 500)).await;
    assert_eq!(outcome, MergeOutcome::Unchanged);
    assert_eq!(engine.get("A").unwrap().status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn test_poll_then_push_scenario() {
    // Poll fetches the order first at PENDING; push later delivers a
    // stale CONFIRMED, then a fresh PREPARING. Canonical state and the
    // cache both end at PREPARING.
    let (engine, cache) = engine_with_cache();

    assert_eq!(
        engine.observe(order("A", OrderStatus::Pending, 100)).await,
        MergeOutcome::Created
    );
    assert_eq!(
        engine.observe(order("A", OrderStatus::Confirmed, 50)).await,
        MergeOutcome::Unchanged
    );
    assert!(engine
        .observe(order("A", OrderStatus::Preparing, 200))
        .await
        .changed());

    assert_eq!(engine.get("A").unwrap().status, OrderStatus::Preparing);
    let cached = cache.get_orders("t-1").await.unwrap();
    assert_eq!(cached[0].status, OrderStatus::Preparing);
}

#[tokio::test]
async fn test_items_adjustment_is_not_status_only() {
    let (engine, _) = engine_with_cache();
    engine.observe(order("A", OrderStatus::Pending, 100)).await;

    let mut revised = order("A", OrderStatus::Pending, 200);
    revised.items.push(OrderLine::new("Filter Coffee", 2, 1.5));
    revised.total = 9.0;

    assert_eq!(
        engine.observe(revised).await,
        MergeOutcome::Updated { status_only: false }
    );
    assert_eq!(engine.get("A").unwrap().items.len(), 2);
}

/// Cache whose very first write stalls, so a concurrent second write
/// would overtake it if the engine let them interleave
#[derive(Debug, Default)]
struct StallingCache {
    inner: MemoryCache,
    stalled: AtomicBool,
}

#[async_trait::async_trait]
impl OrderCache for StallingCache {
    async fn get_orders(&self, tenant_id: &str) -> SyncResult<Vec<Order>> {
        self.inner.get_orders(tenant_id).await
    }

    async fn upsert_order(&self, tenant_id: &str, order: &Order) -> SyncResult<()> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.inner.upsert_order(tenant_id, order).await
    }

    async fn delete_order(&self, tenant_id: &str, order_id: &str) -> SyncResult<()> {
        self.inner.delete_order(tenant_id, order_id).await
    }

    async fn get_stock(&self, tenant_id: &str) -> SyncResult<Vec<OutOfStockRecord>> {
        self.inner.get_stock(tenant_id).await
    }

    async fn upsert_stock(&self, tenant_id: &str, record: &OutOfStockRecord) -> SyncResult<()> {
        self.inner.upsert_stock(tenant_id, record).await
    }
}

#[tokio::test]
async fn test_concurrent_observes_never_leave_stale_cache() {
    // A slow cache write for the PENDING revision must not land after
    // the fresher PREPARING one: merge + cache write are serialized
    // per order id
    let cache = Arc::new(StallingCache::default());
    let engine = Arc::new(ReconcileEngine::new("t-1", cache.clone()));

    let slow = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.observe(order("A", OrderStatus::Pending, 100)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.observe(order("A", OrderStatus::Preparing, 200)).await;
    slow.await.unwrap();

    assert_eq!(engine.get("A").unwrap().status, OrderStatus::Preparing);
    let cached = cache.get_orders("t-1").await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].status, OrderStatus::Preparing);
}

#[tokio::test]
async fn test_cache_warm_start_restores_views() {
    let cache = Arc::new(MemoryCache::new());
    {
        let engine = ReconcileEngine::new("t-1", cache.clone());
        engine.observe(order("A", OrderStatus::Preparing, 100)).await;
        engine.observe(order("B", OrderStatus::Completed, 100)).await;
    }

    // Fresh engine on the same cache, as after a process restart
    let engine = ReconcileEngine::new("t-1", cache);
    let loaded = engine.load_from_cache().await.unwrap();
    assert_eq!(loaded, 2);

    assert_eq!(engine.active_orders().len(), 1);
    let online = engine.view("online").unwrap();
    assert!(online.contains("A"));
    assert!(!online.contains("B"));
}
