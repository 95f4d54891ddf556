//! Peer link descriptors
//!
//! Ephemeral metadata for the local-network peer link: these live only
//! as long as the underlying socket or discovery session.

use serde::{Deserialize, Serialize};

/// Device types that participate in the peer link
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Point-of-sale terminal (coordinator role)
    Pos,
    /// Kitchen display screen
    Kds,
    /// Bump display screen
    Bds,
    /// Manager handheld
    Manager,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Pos => write!(f, "pos"),
            DeviceType::Kds => write!(f, "kds"),
            DeviceType::Bds => write!(f, "bds"),
            DeviceType::Manager => write!(f, "manager"),
        }
    }
}

/// A connected follower, as seen from the coordinator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub client_id: String,
    pub device_type: DeviceType,
    /// RFC3339 connect time
    pub connected_at: String,
    pub ip_address: String,
}

/// Coordinator identity sent to followers in the `registered` ack
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorInfo {
    pub server_id: String,
    pub tenant_id: String,
    pub connected_clients: usize,
    /// RFC3339 coordinator clock, for skew diagnostics
    pub server_time: String,
}

/// A coordinator found via local service discovery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeer {
    pub name: String,
    pub ip_address: String,
    pub port: u16,
    pub tenant_id: Option<String>,
}
