//! Multi-channel order synchronization and reconciliation engine
//!
//! Keeps every device on a restaurant site (POS terminal, kitchen/bump
//! screens, handhelds) converged on a single per-tenant order set, even
//! when the internet connection is flaky. Orders arrive redundantly over
//! three transports — cloud push (WebSocket), cloud poll (HTTP), and a
//! local-network peer link — and are merged by the [`engine`] into one
//! canonical set that feeds the registered channel views and the durable
//! local cache.
//!
//! # Roles
//!
//! - **Coordinator** (POS terminal): runs the peer link server and
//!   re-broadcasts every accepted change so followers converge without
//!   their own cloud connection.
//! - **Follower** (KDS/BDS): discovers the coordinator via mDNS and
//!   receives broadcasts over a direct socket.
//! - **Poll-only** (handhelds): cloud poll only.

pub mod alert;
pub mod cache;
pub mod core;
pub mod engine;
pub mod peer;
pub mod stock;
pub mod transport;
pub mod utils;

pub use crate::core::{Config, DeviceRole, SyncService};
pub use crate::engine::ReconcileEngine;
pub use crate::stock::StockPropagator;
pub use crate::utils::{SyncError, SyncResult};
