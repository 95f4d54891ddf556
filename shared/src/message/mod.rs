//! Wire vocabulary shared by the cloud push connection and the peer link
//!
//! Every message is JSON with a mandatory `type` discriminator. The same
//! vocabulary travels over the cloud WebSocket and the local TCP peer
//! link, so a follower that loses its internet connection keeps speaking
//! the exact protocol it already knows.
//!
//! Unknown `type` values fail to parse; receivers log and drop them —
//! a malformed message never takes a connection down.

use serde::{Deserialize, Serialize};

use crate::order::{KitchenTicket, Order, OrderStatus};
use crate::peer::{CoordinatorInfo, DeviceType};
use crate::stock::OutOfStockRecord;

/// Sync protocol message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Submit a locally-created order upstream
    SubmitOrder { order: Order },
    /// New order observed (carries the normalized kitchen projection)
    OrderCreated {
        order: Order,
        kitchen_ticket: KitchenTicket,
    },
    /// Status change on a known order
    OrderStatusUpdate {
        order_id: String,
        order_number: String,
        status: OrderStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        updated_by: Option<String>,
        /// Epoch millis at which the status was set
        updated_at: i64,
    },
    /// Full snapshot: active orders plus a recent-history tail
    SyncState {
        active_orders: Vec<Order>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        recent_orders: Vec<Order>,
    },
    /// Out-of-stock mark propagation
    StockUpdate { record: OutOfStockRecord },
    /// Follower registration (first message after connect)
    Register {
        device_type: DeviceType,
        tenant_id: String,
    },
    /// Registration acknowledgment from the coordinator
    Registered {
        client_id: String,
        coordinator: CoordinatorInfo,
    },
    /// Keep-alive
    Ping,
    /// Keep-alive response
    Pong,
    /// Protocol-level error
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl SyncMessage {
    /// Build an `order_created` carrying the kitchen projection
    pub fn order_created(order: Order) -> Self {
        let kitchen_ticket = order.kitchen_ticket();
        Self::OrderCreated {
            order,
            kitchen_ticket,
        }
    }

    /// Build an `order_status_update` stamped with the current time
    pub fn status_update(order: &Order, updated_by: Option<String>) -> Self {
        Self::OrderStatusUpdate {
            order_id: order.id.clone(),
            order_number: order.order_number.clone(),
            status: order.status,
            updated_by,
            updated_at: order.updated_at,
        }
    }

    /// Build a tenant-mismatch rejection
    pub fn tenant_mismatch() -> Self {
        Self::Error {
            message: "Tenant ID mismatch".to_string(),
            code: Some("TENANT_MISMATCH".to_string()),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{Channel, OrderLine};

    #[test]
    fn test_type_discriminator() {
        let msg = SyncMessage::Ping;
        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_order_created_round_trip() {
        let order = Order::new(
            "o-9",
            "15",
            Channel::AggregatorA,
            vec![OrderLine::new("Thali", 1, 9.0)],
        );
        let msg = SyncMessage::order_created(order.clone());
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"order_created""#));
        assert!(json.contains("kitchen_ticket"));

        match SyncMessage::from_json(&json).unwrap() {
            SyncMessage::OrderCreated {
                order: parsed,
                kitchen_ticket,
            } => {
                assert_eq!(parsed.id, order.id);
                assert_eq!(kitchen_ticket.order_id, order.id);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_status_update_fields() {
        let json = r#"{
            "type": "order_status_update",
            "order_id": "A",
            "order_number": "3",
            "status": "PREPARING",
            "updated_at": 1700000000000
        }"#;
        match SyncMessage::from_json(json).unwrap() {
            SyncMessage::OrderStatusUpdate {
                order_id,
                status,
                updated_by,
                ..
            } => {
                assert_eq!(order_id, "A");
                assert_eq!(status, OrderStatus::Preparing);
                assert!(updated_by.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_parse_error() {
        let json = r#"{"type":"totally_new_thing","payload":1}"#;
        assert!(SyncMessage::from_json(json).is_err());
    }

    #[test]
    fn test_register_lowercase_device_type() {
        let msg = SyncMessage::Register {
            device_type: DeviceType::Kds,
            tenant_id: "t-1".to_string(),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""device_type":"kds""#));
    }
}
