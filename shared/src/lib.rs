//! Shared types for the order synchronization suite
//!
//! These types are used by every device role (POS coordinator, kitchen
//! followers, poll-only handhelds) and define the wire vocabulary spoken
//! over both the cloud connection and the local peer link.

pub mod message;
pub mod order;
pub mod peer;
pub mod stock;
pub mod util;

pub use message::SyncMessage;
pub use order::{Channel, KitchenTicket, Order, OrderLine, OrderStatus};
pub use peer::{CoordinatorInfo, DeviceType, DiscoveredPeer, PeerInfo};
pub use stock::{OutOfStockRecord, Withdraw};
