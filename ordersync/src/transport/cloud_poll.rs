//! Cloud Poll transport — fixed-interval HTTP fetch
//!
//! The simplest, always-available fallback: one immediate fetch, then a
//! fetch every interval. No backoff on failure — the interval itself is
//! the rate limit. New orders (unseen id AND created after the
//! high-water-mark) fire the arrival alert exactly once; every fetched
//! record, new or not, is forwarded to the reconciliation engine so
//! status changes on known orders are still picked up.

use serde::Deserialize;
use shared::order::Order;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::alert::AlertSink;
use crate::engine::ReconcileEngine;
use crate::utils::{SyncError, SyncResult};

/// Poll response contract: `{ success, orders }`
#[derive(Debug, Deserialize)]
struct PollResponse {
    success: bool,
    #[serde(default)]
    orders: Vec<Order>,
}

/// Dedup state for arrival alerts
#[derive(Debug, Default)]
struct PollState {
    /// Ids already processed (alerted or deliberately not)
    seen: HashSet<String>,
    /// Latest creation timestamp already processed (epoch millis)
    high_water_mark: i64,
}

/// Cloud poll transport
pub struct CloudPollTransport {
    url: String,
    interval: Duration,
    http: reqwest::Client,
    engine: Arc<ReconcileEngine>,
    alert: Arc<dyn AlertSink>,
    state: Arc<tokio::sync::Mutex<PollState>>,
    cancel: StdMutex<Option<CancellationToken>>,
}

impl CloudPollTransport {
    pub fn new(
        url: impl Into<String>,
        interval: Duration,
        engine: Arc<ReconcileEngine>,
        alert: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            url: url.into(),
            interval,
            http: reqwest::Client::new(),
            engine,
            alert,
            state: Arc::new(tokio::sync::Mutex::new(PollState::default())),
            cancel: StdMutex::new(None),
        }
    }

    /// Start polling: one immediate fetch, then every interval
    ///
    /// A second `start()` stops the previous loop cleanly first, so two
    /// intervals never run side by side. The seen-id set and
    /// high-water-mark survive restarts — no duplicate alerts.
    pub fn start(&self, tenant_id: &str) {
        let token = CancellationToken::new();
        {
            let mut guard = self.cancel.lock().expect("cancel lock poisoned");
            if let Some(old) = guard.replace(token.clone()) {
                old.cancel();
            }
        }

        let url = self.url.clone();
        let interval = self.interval;
        let http = self.http.clone();
        let engine = self.engine.clone();
        let alert = self.alert.clone();
        let state = self.state.clone();
        let tenant_id = tenant_id.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,

                    _ = ticker.tick() => {
                        match fetch(&http, &url, &tenant_id).await {
                            Ok(orders) => {
                                // A fetch in flight at stop() completes,
                                // but its result is discarded
                                if token.is_cancelled() {
                                    break;
                                }
                                let new_ids = {
                                    let mut state = state.lock().await;
                                    classify_new(&mut state, &orders)
                                };
                                for order in &orders {
                                    if new_ids.contains(&order.id) {
                                        alert.order_arrived(order);
                                    }
                                }
                                for order in orders {
                                    engine.observe(order).await;
                                }
                            }
                            Err(e) => {
                                // Swallowed: next interval retries unconditionally
                                tracing::warn!(
                                    target: "cloud_poll",
                                    "Fetch failed, retrying next interval: {e}"
                                );
                            }
                        }
                    }
                }
            }
            tracing::debug!(target: "cloud_poll", "Poll loop stopped");
        });
    }

    /// Cancel the interval timer synchronously
    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().expect("cancel lock poisoned").take() {
            token.cancel();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.cancel
            .lock()
            .expect("cancel lock poisoned")
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }
}

async fn fetch(http: &reqwest::Client, url: &str, tenant_id: &str) -> SyncResult<Vec<Order>> {
    let resp = http
        .get(url)
        .query(&[("tenant_id", tenant_id)])
        .send()
        .await
        .map_err(|e| SyncError::transport(format!("Poll request failed: {e}")))?;

    if !resp.status().is_success() {
        return Err(SyncError::transport(format!(
            "Poll returned HTTP {}",
            resp.status()
        )));
    }

    let body: PollResponse = resp
        .json()
        .await
        .map_err(|e| SyncError::protocol(format!("Invalid poll response: {e}")))?;

    if !body.success {
        return Err(SyncError::transport("Poll response success=false"));
    }

    Ok(body.orders)
}

/// Classify which fetched orders are "new" (alert-worthy): unseen id AND
/// created after the high-water-mark. Updates both on success only, so a
/// failed fetch never resets them.
fn classify_new(state: &mut PollState, orders: &[Order]) -> HashSet<String> {
    let mut new_ids = HashSet::new();

    for order in orders {
        if !state.seen.contains(&order.id) && order.created_at > state.high_water_mark {
            new_ids.insert(order.id.clone());
        }
        state.seen.insert(order.id.clone());
    }

    if let Some(max_created) = orders.iter().map(|o| o.created_at).max() {
        state.high_water_mark = state.high_water_mark.max(max_created);
    }

    new_ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::order::{Channel, OrderLine};

    fn order_at(id: &str, created_at: i64) -> Order {
        let mut o = Order::new(id, "1", Channel::Online, vec![OrderLine::new("Dosa", 1, 4.5)]);
        o.created_at = created_at;
        o
    }

    #[test]
    fn test_first_sight_is_new() {
        let mut state = PollState::default();
        let new = classify_new(&mut state, &[order_at("A", 100)]);
        assert!(new.contains("A"));
        assert_eq!(state.high_water_mark, 100);
    }

    #[test]
    fn test_refetch_is_not_new() {
        let mut state = PollState::default();
        classify_new(&mut state, &[order_at("A", 100)]);
        let new = classify_new(&mut state, &[order_at("A", 100)]);
        assert!(new.is_empty());
    }

    #[test]
    fn test_stale_created_at_not_alerted() {
        let mut state = PollState::default();
        classify_new(&mut state, &[order_at("A", 100)]);
        // Unseen id but created before the high-water-mark: forwarded to
        // the engine by the caller, but no alert
        let new = classify_new(&mut state, &[order_at("B", 50)]);
        assert!(new.is_empty());
        assert!(state.seen.contains("B"));
    }

    #[test]
    fn test_high_water_mark_monotonic() {
        let mut state = PollState::default();
        classify_new(&mut state, &[order_at("A", 100)]);
        classify_new(&mut state, &[order_at("B", 50)]);
        assert_eq!(state.high_water_mark, 100);
        classify_new(&mut state, &[order_at("C", 200)]);
        assert_eq!(state.high_water_mark, 200);
    }
}
