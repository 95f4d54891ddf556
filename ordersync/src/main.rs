//! Order sync service entry point
//!
//! Reads the device configuration from the environment, wires the
//! transports for the configured role, and runs until Ctrl-C.

use anyhow::Result;
use ordersync::alert::AudioAlert;
use ordersync::cache::MemoryCache;
use ordersync::utils::init_logger_with_file;
use ordersync::{Config, SyncService};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logger_with_file(Some(&config.log_level), config.log_dir.as_deref());

    tracing::info!(
        tenant = %config.tenant_id,
        role = ?config.device_role,
        device = %config.device_type,
        "Starting order sync service"
    );

    let cache = Arc::new(MemoryCache::new());
    let alert = Arc::new(AudioAlert::new(
        std::env::var("ALERT_SOUND").ok().map(Into::into),
    ));

    let service = SyncService::new(config, cache, alert);
    service.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    service.stop();

    Ok(())
}
