//! 同步服务装配
//!
//! Wires the transports, the reconciliation engine, and the stock
//! propagator together according to the device role:
//!
//! - coordinator: peer link server + cloud push + cloud poll
//! - follower: peer link client + cloud push + cloud poll
//! - poll-only: cloud transports only
//!
//! Every inbound path converges on the same dispatch: stock updates go
//! to the propagator, everything else to the engine.

use serde::Serialize;
use shared::message::SyncMessage;
use shared::order::{Order, OrderStatus};
use shared::util::now_millis;
use std::sync::Arc;
use std::time::Duration;

use crate::alert::AlertSink;
use crate::cache::OrderCache;
use crate::core::config::{Config, DeviceRole};
use crate::engine::{MergeOutcome, ReconcileEngine};
use crate::peer::{FollowerHandler, PeerCoordinator, PeerFollower};
use crate::stock::StockPropagator;
use crate::transport::{CloudPollTransport, CloudPushTransport, ConnectionState, PushHandler};
use crate::utils::{SyncError, SyncResult};

/// Point-in-time service health, for the status indicator
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub push_state: ConnectionState,
    pub polling: bool,
    pub peer_link_up: bool,
    pub connected_peers: usize,
    pub active_orders: usize,
}

/// Top-level sync service
pub struct SyncService {
    config: Config,
    engine: Arc<ReconcileEngine>,
    propagator: Arc<StockPropagator>,
    push: Option<Arc<CloudPushTransport>>,
    poll: Option<Arc<CloudPollTransport>>,
    coordinator: Option<Arc<PeerCoordinator>>,
    follower: Option<Arc<PeerFollower>>,
}

impl SyncService {
    pub fn new(config: Config, cache: Arc<dyn OrderCache>, alert: Arc<dyn AlertSink>) -> Self {
        let engine = Arc::new(ReconcileEngine::new(config.tenant_id.clone(), cache.clone()));
        let propagator = Arc::new(StockPropagator::new(
            config.tenant_id.clone(),
            engine.clone(),
            cache,
        ));

        let push = config
            .enable_cloud_push
            .then(|| Arc::new(CloudPushTransport::new(config.cloud_ws_url.clone())));

        let poll = config.enable_cloud_poll.then(|| {
            Arc::new(CloudPollTransport::new(
                config.cloud_poll_url.clone(),
                Duration::from_secs(config.poll_interval_secs),
                engine.clone(),
                alert,
            ))
        });

        let (coordinator, follower) = if config.enable_peer_link {
            match config.device_role {
                DeviceRole::Coordinator => (
                    Some(Arc::new(PeerCoordinator::new(
                        config.tenant_id.clone(),
                        config.peer_port,
                    ))),
                    None,
                ),
                DeviceRole::Follower => (
                    None,
                    Some(Arc::new(PeerFollower::new(
                        config.device_type,
                        config.tenant_id.clone(),
                    ))),
                ),
                DeviceRole::PollOnly => (None, None),
            }
        } else {
            (None, None)
        };

        Self {
            config,
            engine,
            propagator,
            push,
            poll,
            coordinator,
            follower,
        }
    }

    /// Bring every configured transport up
    pub async fn start(&self) -> SyncResult<()> {
        let orders = self.engine.load_from_cache().await?;
        let marks = self.propagator.load_from_cache().await?;
        tracing::info!(
            target: "service",
            orders,
            stock_marks = marks,
            "State restored from cache"
        );

        let handler = Arc::new(EngineHandler {
            engine: self.engine.clone(),
            propagator: self.propagator.clone(),
        });

        if let Some(coordinator) = &self.coordinator {
            let address = coordinator.start().await?;
            self.engine.set_broadcaster(coordinator.clone());
            tracing::info!(target: "service", address, "Peer link coordinator up");

            // Follower → coordinator traffic feeds the same dispatch
            let mut inbound = coordinator.subscribe_inbound();
            let engine = self.engine.clone();
            let propagator = self.propagator.clone();
            tokio::spawn(async move {
                while let Ok((client_id, msg)) = inbound.recv().await {
                    tracing::debug!(target: "service", %client_id, "Peer message received");
                    dispatch(&engine, &propagator, msg).await;
                }
            });
        }

        if let Some(follower) = &self.follower {
            match follower.auto_connect(handler.clone()).await {
                Ok(Some(info)) => {
                    tracing::info!(
                        target: "service",
                        coordinator = %info.server_id,
                        "Joined peer link"
                    );
                }
                Ok(None) => {
                    tracing::warn!(
                        target: "service",
                        "No coordinator on the local network, cloud transports only"
                    );
                }
                Err(e) => {
                    tracing::warn!(target: "service", "Peer link join failed: {e}");
                }
            }
        }

        if let Some(push) = &self.push {
            push.connect(&self.config.tenant_id, handler);
        }

        if let Some(poll) = &self.poll {
            poll.start(&self.config.tenant_id);
        }

        Ok(())
    }

    /// Take every transport down; state stays in memory and cache
    pub fn stop(&self) {
        if let Some(poll) = &self.poll {
            poll.stop();
        }
        if let Some(push) = &self.push {
            push.disconnect();
        }
        if let Some(follower) = &self.follower {
            follower.disconnect();
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.stop();
        }
        tracing::info!(target: "service", "Sync service stopped");
    }

    /// Enter a locally-created order and forward it upstream
    pub async fn submit_order(&self, order: Order) -> MergeOutcome {
        let outcome = self.engine.observe(order.clone()).await;
        if outcome.changed() {
            if let Some(push) = &self.push {
                push.send(SyncMessage::SubmitOrder { order }).await;
            }
        }
        outcome
    }

    /// Apply a local status change and forward it upstream
    pub async fn update_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> SyncResult<MergeOutcome> {
        // Force the revision forward even if the clock has not ticked
        // since the last write
        let updated_at = self
            .engine
            .get(order_id)
            .map(|o| now_millis().max(o.updated_at + 1))
            .unwrap_or_else(now_millis);
        let outcome = self.engine.observe_status(order_id, status, updated_at).await;

        if outcome.changed() {
            let order = self
                .engine
                .get(order_id)
                .ok_or_else(|| SyncError::conflict(format!("Order vanished: {order_id}")))?;
            if let Some(push) = &self.push {
                push.send(SyncMessage::status_update(&order, None)).await;
            }
        }
        Ok(outcome)
    }

    /// Push a full state snapshot to followers (coordinator only)
    ///
    /// Called after a follower (re)joins; registration alone does not
    /// trigger it.
    pub fn broadcast_sync_state(&self) -> usize {
        self.engine.broadcast(self.engine.sync_state())
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            push_state: self
                .push
                .as_ref()
                .map(|p| p.state())
                .unwrap_or(ConnectionState::Disconnected),
            polling: self.poll.as_ref().is_some_and(|p| p.is_polling()),
            peer_link_up: self
                .coordinator
                .as_ref()
                .map(|c| c.is_running())
                .or_else(|| self.follower.as_ref().map(|f| f.is_connected()))
                .unwrap_or(false),
            connected_peers: self
                .coordinator
                .as_ref()
                .map(|c| c.connected_peers().len())
                .unwrap_or(0),
            active_orders: self.engine.active_orders().len(),
        }
    }

    pub fn engine(&self) -> &Arc<ReconcileEngine> {
        &self.engine
    }

    pub fn propagator(&self) -> &Arc<StockPropagator> {
        &self.propagator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Route one inbound message to its component
async fn dispatch(engine: &ReconcileEngine, propagator: &StockPropagator, msg: SyncMessage) {
    match msg {
        SyncMessage::StockUpdate { record } => propagator.apply_remote(record).await,
        other => engine.observe_message(other).await,
    }
}

/// Bridges transport callbacks into the engine/propagator
struct EngineHandler {
    engine: Arc<ReconcileEngine>,
    propagator: Arc<StockPropagator>,
}

impl EngineHandler {
    fn spawn_dispatch(&self, msg: SyncMessage) {
        let engine = self.engine.clone();
        let propagator = self.propagator.clone();
        tokio::spawn(async move {
            dispatch(&engine, &propagator, msg).await;
        });
    }
}

impl PushHandler for EngineHandler {
    fn on_connect(&self) {
        tracing::info!(target: "service", "Cloud push connected");
    }

    fn on_message(&self, msg: SyncMessage) {
        self.spawn_dispatch(msg);
    }

    fn on_disconnect(&self) {
        tracing::warn!(target: "service", "Cloud push disconnected");
    }

    fn on_terminal(&self, err: SyncError) {
        tracing::error!(target: "service", "Cloud push gave up: {err}");
    }
}

impl FollowerHandler for EngineHandler {
    fn on_message(&self, msg: SyncMessage) {
        self.spawn_dispatch(msg);
    }

    fn on_disconnect(&self) {
        // Deliberate: rediscovery is an operator decision
        tracing::warn!(target: "service", "Peer link lost, not reconnecting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::NullAlert;
    use crate::cache::MemoryCache;
    use shared::order::{Channel, OrderLine};

    fn service() -> SyncService {
        let mut config = Config::for_tenant("t-1");
        config.enable_cloud_push = false;
        config.enable_cloud_poll = false;
        config.enable_peer_link = false;
        SyncService::new(config, Arc::new(MemoryCache::new()), Arc::new(NullAlert))
    }

    #[tokio::test]
    async fn test_submit_and_update() {
        let service = service();
        let order = Order::new("A", "1", Channel::Pos, vec![OrderLine::new("Dosa", 1, 4.5)]);

        assert_eq!(service.submit_order(order).await, MergeOutcome::Created);

        let outcome = service
            .update_status("A", OrderStatus::Preparing)
            .await
            .unwrap();
        assert!(outcome.changed());
        assert_eq!(
            service.engine().get("A").unwrap().status,
            OrderStatus::Preparing
        );
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let service = service();
        let status = service.status();
        assert_eq!(status.push_state, ConnectionState::Disconnected);
        assert!(!status.polling);
        assert!(!status.peer_link_up);
        assert_eq!(status.active_orders, 0);
    }
}
