//! Order-arrival alerts
//!
//! The cloud poll transport fires an audible/visual alert exactly once
//! per newly observed order. Playback itself belongs to the UI layer;
//! this seam decides *which* cue to use and degrades gracefully when the
//! primary notification asset is unavailable.

use std::path::PathBuf;

use shared::order::Order;

/// Sink for new-order alerts
pub trait AlertSink: Send + Sync {
    fn order_arrived(&self, order: &Order);
}

/// Default alert: primary notification asset with synthesized-tone fallback
#[derive(Debug)]
pub struct AudioAlert {
    asset_path: Option<PathBuf>,
}

impl AudioAlert {
    pub fn new(asset_path: Option<PathBuf>) -> Self {
        Self { asset_path }
    }

    fn asset_available(&self) -> bool {
        self.asset_path.as_deref().is_some_and(|p| p.exists())
    }
}

impl AlertSink for AudioAlert {
    fn order_arrived(&self, order: &Order) {
        if self.asset_available() {
            tracing::info!(
                target: "alert",
                order_id = %order.id,
                order_number = %order.order_number,
                cue = "asset",
                "New order arrived"
            );
        } else {
            // Asset missing or unreadable: fall back to a synthesized tone
            tracing::info!(
                target: "alert",
                order_id = %order.id,
                order_number = %order.order_number,
                cue = "tone",
                "New order arrived"
            );
        }
    }
}

/// No-op sink for tests
#[derive(Debug, Default)]
pub struct NullAlert;

impl AlertSink for NullAlert {
    fn order_arrived(&self, _order: &Order) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_asset_degrades() {
        let alert = AudioAlert::new(Some(PathBuf::from("/nonexistent/ding.wav")));
        assert!(!alert.asset_available());

        let alert = AudioAlert::new(None);
        assert!(!alert.asset_available());
    }
}
