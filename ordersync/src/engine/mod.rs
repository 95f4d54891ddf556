//! 订单和解引擎
//!
//! Every transport feeds observed order records into one place. The
//! engine decides, per record, whether it creates, replaces, or is
//! discarded against the canonical set, then fans the result out:
//! durable cache write, per-screen view refresh, and (on a coordinator)
//! re-broadcast over the peer link.
//!
//! Merge rules, in evaluation order:
//! 1. unknown id — insert
//! 2. byte-identical payload — idempotent no-op
//! 3. incumbent terminal — locked, never overwritten
//! 4. older or equal `updated_at` — stale, incumbent stays
//! 5. illegal status transition — rejected with a warning
//! 6. otherwise — replace

mod views;

pub use views::{ChannelView, QueueView};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shared::message::SyncMessage;
use shared::order::{Order, OrderStatus};
use std::sync::Arc;
use std::sync::RwLock;

use crate::cache::OrderCache;
use crate::peer::PeerCoordinator;
use crate::utils::SyncResult;

/// Terminal orders kept in the `sync_state` history tail
const RECENT_HISTORY_LIMIT: usize = 50;

/// Seam for coordinator re-broadcast, so the engine never owns a socket
pub trait PeerBroadcaster: Send + Sync {
    /// Fan a message out to followers; returns the recipient count
    fn broadcast(&self, msg: SyncMessage) -> usize;
}

impl PeerBroadcaster for PeerCoordinator {
    fn broadcast(&self, msg: SyncMessage) -> usize {
        PeerCoordinator::broadcast(self, msg)
    }
}

/// What a merge did to the canonical set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Duplicate, stale, locked, or illegal — canonical set untouched
    Unchanged,
    /// First sighting of this id
    Created,
    /// Known order replaced by a newer revision
    Updated {
        /// Only status/timestamp moved; items and totals are unchanged
        status_only: bool,
    },
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Pure merge decision between the incumbent and an incoming revision
fn merge_orders(current: &Order, incoming: &Order) -> MergeOutcome {
    if incoming == current {
        return MergeOutcome::Unchanged;
    }

    if current.status.is_terminal() {
        tracing::debug!(
            target: "engine",
            order_id = %current.id,
            status = %current.status,
            "Incumbent is terminal, ignoring revision"
        );
        return MergeOutcome::Unchanged;
    }

    // Equal timestamps keep the incumbent: first writer wins the tie
    if incoming.updated_at <= current.updated_at {
        tracing::debug!(
            target: "engine",
            order_id = %current.id,
            "Stale revision ({} <= {})",
            incoming.updated_at,
            current.updated_at
        );
        return MergeOutcome::Unchanged;
    }

    if incoming.status != current.status && !current.status.can_transition(incoming.status) {
        tracing::warn!(
            target: "engine",
            order_id = %current.id,
            from = %current.status,
            to = %incoming.status,
            "Illegal status transition, keeping incumbent"
        );
        return MergeOutcome::Unchanged;
    }

    let status_only = incoming.items == current.items
        && incoming.total == current.total
        && incoming.table == current.table
        && incoming.channel == current.channel
        && incoming.order_number == current.order_number;

    MergeOutcome::Updated { status_only }
}

/// Reconciliation engine — single point of convergence for all transports
pub struct ReconcileEngine {
    tenant_id: String,
    cache: Arc<dyn OrderCache>,
    canonical: DashMap<String, Order>,
    /// Serializes merge + cache write per id; the DashMap entry lock
    /// alone cannot be held across the async cache upsert
    write_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    views: Vec<Arc<QueueView>>,
    broadcaster: RwLock<Option<Arc<dyn PeerBroadcaster>>>,
}

impl ReconcileEngine {
    /// Engine with the standard four screen views
    pub fn new(tenant_id: impl Into<String>, cache: Arc<dyn OrderCache>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            cache,
            canonical: DashMap::new(),
            write_locks: DashMap::new(),
            views: vec![
                Arc::new(QueueView::kitchen()),
                Arc::new(QueueView::tables()),
                Arc::new(QueueView::aggregators()),
                Arc::new(QueueView::online()),
            ],
            broadcaster: RwLock::new(None),
        }
    }

    /// Attach the coordinator fan-out; followers and poll-only devices
    /// never call this
    pub fn set_broadcaster(&self, broadcaster: Arc<dyn PeerBroadcaster>) {
        *self
            .broadcaster
            .write()
            .expect("broadcaster lock poisoned") = Some(broadcaster);
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Merge one observed order record into the canonical set
    pub async fn observe(&self, incoming: Order) -> MergeOutcome {
        // Read-merge-write is serialized per id end to end, cache write
        // included, so a stale revision can never land in the cache
        // after a fresher one. Different ids proceed independently.
        let id_lock = self
            .write_locks
            .entry(incoming.id.clone())
            .or_default()
            .clone();
        let _guard = id_lock.lock().await;

        let outcome = match self.canonical.entry(incoming.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(incoming.clone());
                MergeOutcome::Created
            }
            Entry::Occupied(mut slot) => {
                let outcome = merge_orders(slot.get(), &incoming);
                if outcome.changed() {
                    slot.insert(incoming.clone());
                }
                outcome
            }
        };

        if outcome.changed() {
            self.commit(&incoming, outcome).await;
        }
        outcome
    }

    /// Merge a bare status change against the known record
    ///
    /// Unknown ids are skipped: a status update carries too little to
    /// reconstruct the order, so we wait for a full record to arrive.
    pub async fn observe_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        updated_at: i64,
    ) -> MergeOutcome {
        let Some(current) = self.canonical.get(order_id).map(|e| e.value().clone()) else {
            tracing::warn!(
                target: "engine",
                order_id,
                %status,
                "Status update for unknown order, skipping"
            );
            return MergeOutcome::Unchanged;
        };

        let mut candidate = current;
        candidate.status = status;
        candidate.updated_at = updated_at;
        self.observe(candidate).await
    }

    /// Dispatch one protocol message into the engine
    ///
    /// Stock updates are deliberately not handled here; the service
    /// layer routes them to the stock propagator.
    pub async fn observe_message(&self, msg: SyncMessage) {
        match msg {
            SyncMessage::OrderCreated { order, .. } | SyncMessage::SubmitOrder { order } => {
                self.observe(order).await;
            }
            SyncMessage::OrderStatusUpdate {
                order_id,
                status,
                updated_at,
                ..
            } => {
                self.observe_status(&order_id, status, updated_at).await;
            }
            SyncMessage::SyncState {
                active_orders,
                recent_orders,
            } => {
                let count = active_orders.len() + recent_orders.len();
                for order in active_orders.into_iter().chain(recent_orders) {
                    self.observe(order).await;
                }
                tracing::info!(target: "engine", count, "State snapshot merged");
            }
            other => {
                tracing::debug!(target: "engine", "Ignoring message: {other:?}");
            }
        }
    }

    /// Register an extra screen view; call before the engine is shared
    pub fn register_view(&mut self, view: Arc<QueueView>) {
        self.views.push(view);
    }

    /// On-demand full reconciliation against the durable cache
    ///
    /// Unlike [`load_from_cache`](Self::load_from_cache) every cached
    /// record goes through the merge rules, so a cache another process
    /// advanced layers on top of the canonical set instead of
    /// overwriting it. Returns how many records changed.
    pub async fn merge(&self) -> SyncResult<usize> {
        let orders = self.cache.get_orders(&self.tenant_id).await?;
        let mut changed = 0;
        for order in orders {
            if self.observe(order).await.changed() {
                changed += 1;
            }
        }
        tracing::info!(target: "engine", changed, "Full reconciliation done");
        Ok(changed)
    }

    /// Warm the canonical set from the durable cache at startup
    pub async fn load_from_cache(&self) -> SyncResult<usize> {
        let orders = self.cache.get_orders(&self.tenant_id).await?;
        let count = orders.len();
        for order in orders {
            self.project(&order);
            self.canonical.insert(order.id.clone(), order);
        }
        tracing::info!(target: "engine", count, "Canonical set loaded from cache");
        Ok(count)
    }

    /// Snapshot for late joiners: active set plus a recent-history tail
    pub fn sync_state(&self) -> SyncMessage {
        let mut active = Vec::new();
        let mut recent = Vec::new();
        for entry in self.canonical.iter() {
            if entry.value().is_active() {
                active.push(entry.value().clone());
            } else {
                recent.push(entry.value().clone());
            }
        }
        recent.sort_by_key(|o| std::cmp::Reverse(o.updated_at));
        recent.truncate(RECENT_HISTORY_LIMIT);

        SyncMessage::SyncState {
            active_orders: active,
            recent_orders: recent,
        }
    }

    pub fn get(&self, order_id: &str) -> Option<Order> {
        self.canonical.get(order_id).map(|e| e.value().clone())
    }

    pub fn active_orders(&self) -> Vec<Order> {
        self.canonical
            .iter()
            .filter(|e| e.value().is_active())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Look a screen view up by name
    pub fn view(&self, name: &str) -> Option<Arc<QueueView>> {
        self.views.iter().find(|v| v.name() == name).cloned()
    }

    pub fn views(&self) -> &[Arc<QueueView>] {
        &self.views
    }

    /// Fan a message out over the peer link, if one is attached
    pub fn broadcast(&self, msg: SyncMessage) -> usize {
        let guard = self.broadcaster.read().expect("broadcaster lock poisoned");
        match guard.as_ref() {
            Some(b) => b.broadcast(msg),
            None => 0,
        }
    }

    /// Cache write, view refresh, and coordinator re-broadcast
    async fn commit(&self, order: &Order, outcome: MergeOutcome) {
        // A cache failure is logged, never propagated: the in-memory
        // canonical set already advanced and peers still deserve the event
        if let Err(e) = self.cache.upsert_order(&self.tenant_id, order).await {
            tracing::error!(
                target: "engine",
                order_id = %order.id,
                "Cache write failed: {e}"
            );
        }

        self.project(order);

        let msg = match outcome {
            MergeOutcome::Updated { status_only: true } => SyncMessage::status_update(order, None),
            _ => SyncMessage::order_created(order.clone()),
        };
        let sent = self.broadcast(msg);
        if sent > 0 {
            tracing::debug!(
                target: "engine",
                order_id = %order.id,
                peers = sent,
                "Re-broadcast to peer link"
            );
        }
    }

    /// Refresh every view's slice of this order
    fn project(&self, order: &Order) {
        for view in &self.views {
            if view.interested(order) && order.is_active() {
                view.upsert(order);
            } else {
                view.remove(&order.id);
            }
        }
    }
}

impl std::fmt::Debug for ReconcileEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileEngine")
            .field("tenant_id", &self.tenant_id)
            .field("orders", &self.canonical.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use shared::order::{Channel, OrderLine};

    fn engine() -> ReconcileEngine {
        ReconcileEngine::new("t-1", Arc::new(MemoryCache::new()))
    }

    fn order(id: &str, status: OrderStatus, updated_at: i64) -> Order {
        let mut o = Order::new(id, "9", Channel::Pos, vec![OrderLine::new("Vada", 2, 2.5)]);
        o.status = status;
        o.updated_at = updated_at;
        o
    }

    #[tokio::test]
    async fn test_create_then_dedup() {
        let engine = engine();
        let o = order("A", OrderStatus::Pending, 100);

        assert_eq!(engine.observe(o.clone()).await, MergeOutcome::Created);
        // Same payload again: idempotent
        assert_eq!(engine.observe(o).await, MergeOutcome::Unchanged);
        assert_eq!(engine.active_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_newer_revision_wins() {
        let engine = engine();
        engine.observe(order("A", OrderStatus::Pending, 100)).await;

        let outcome = engine.observe(order("A", OrderStatus::Preparing, 200)).await;
        assert_eq!(outcome, MergeOutcome::Updated { status_only: true });
        assert_eq!(engine.get("A").unwrap().status, OrderStatus::Preparing);
    }

    #[tokio::test]
    async fn test_stale_and_tied_revisions_ignored() {
        let engine = engine();
        engine.observe(order("A", OrderStatus::Preparing, 200)).await;

        // Older timestamp
        assert_eq!(
            engine.observe(order("A", OrderStatus::Confirmed, 100)).await,
            MergeOutcome::Unchanged
        );
        // Tied timestamp keeps the incumbent
        assert_eq!(
            engine.observe(order("A", OrderStatus::Ready, 200)).await,
            MergeOutcome::Unchanged
        );
        assert_eq!(engine.get("A").unwrap().status, OrderStatus::Preparing);
    }

    #[tokio::test]
    async fn test_terminal_never_overwritten() {
        let engine = engine();
        engine.observe(order("A", OrderStatus::Completed, 100)).await;

        let outcome = engine.observe(order("A", OrderStatus::Preparing, 999)).await;
        assert_eq!(outcome, MergeOutcome::Unchanged);
        assert_eq!(engine.get("A").unwrap().status, OrderStatus::Completed);
    }

    #[tokio::test]
    async fn test_ready_to_cancelled_rejected() {
        let engine = engine();
        engine.observe(order("A", OrderStatus::Ready, 100)).await;

        let outcome = engine.observe(order("A", OrderStatus::Cancelled, 200)).await;
        assert_eq!(outcome, MergeOutcome::Unchanged);
        assert_eq!(engine.get("A").unwrap().status, OrderStatus::Ready);
    }

    #[tokio::test]
    async fn test_status_update_for_unknown_order_skipped() {
        let engine = engine();
        let outcome = engine
            .observe_status("ghost", OrderStatus::Preparing, 100)
            .await;
        assert_eq!(outcome, MergeOutcome::Unchanged);
        assert!(engine.get("ghost").is_none());
    }

    #[tokio::test]
    async fn test_terminal_order_leaves_views() {
        let engine = engine();
        engine.observe(order("A", OrderStatus::Preparing, 100)).await;
        assert!(engine.view("kitchen").unwrap().contains("A"));

        engine.observe(order("A", OrderStatus::Completed, 200)).await;
        assert!(!engine.view("kitchen").unwrap().contains("A"));
        // Still canonical, just not displayed
        assert!(engine.get("A").is_some());
    }

    #[tokio::test]
    async fn test_sync_state_splits_active_and_recent() {
        let engine = engine();
        engine.observe(order("A", OrderStatus::Preparing, 100)).await;
        engine.observe(order("B", OrderStatus::Completed, 100)).await;

        match engine.sync_state() {
            SyncMessage::SyncState {
                active_orders,
                recent_orders,
            } => {
                assert_eq!(active_orders.len(), 1);
                assert_eq!(active_orders[0].id, "A");
                assert_eq!(recent_orders.len(), 1);
                assert_eq!(recent_orders[0].id, "B");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_registered_view_receives_orders() {
        let mut engine = engine();
        engine.register_view(Arc::new(QueueView::new(
            "big-spenders",
            Box::new(|o: &Order| o.total > 100.0),
        )));

        let mut big = order("A", OrderStatus::Pending, 100);
        big.total = 250.0;
        engine.observe(big).await;
        engine.observe(order("B", OrderStatus::Pending, 100)).await;

        let view = engine.view("big-spenders").unwrap();
        assert!(view.contains("A"));
        assert!(!view.contains("B"));
    }

    #[tokio::test]
    async fn test_merge_layers_cache_on_top() {
        let cache = Arc::new(MemoryCache::new());
        let engine = ReconcileEngine::new("t-1", cache.clone());
        engine.observe(order("A", OrderStatus::Preparing, 200)).await;

        // Another process left a stale revision and a new order behind
        cache
            .upsert_order("t-1", &order("A", OrderStatus::Pending, 100))
            .await
            .unwrap();
        cache
            .upsert_order("t-1", &order("B", OrderStatus::Pending, 100))
            .await
            .unwrap();

        let changed = engine.merge().await.unwrap();
        assert_eq!(changed, 1);
        // Stale cache revision lost to the canonical record
        assert_eq!(engine.get("A").unwrap().status, OrderStatus::Preparing);
        assert!(engine.get("B").is_some());
    }

    #[tokio::test]
    async fn test_commit_writes_cache() {
        let cache = Arc::new(MemoryCache::new());
        let engine = ReconcileEngine::new("t-1", cache.clone());
        engine.observe(order("A", OrderStatus::Pending, 100)).await;

        let cached = cache.get_orders("t-1").await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, "A");
    }
}
