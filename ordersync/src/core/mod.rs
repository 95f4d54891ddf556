//! Service assembly: configuration plus role-based wiring

mod config;
mod service;

pub use config::{Config, DeviceRole};
pub use service::{ServiceStatus, SyncService};
