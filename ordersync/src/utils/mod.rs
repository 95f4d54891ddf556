//! Error types and logging infrastructure

mod error;
mod logger;

pub use error::{SyncError, SyncResult};
pub use logger::{init_logger, init_logger_with_file};
