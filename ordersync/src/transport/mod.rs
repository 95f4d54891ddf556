//! Cloud transports
//!
//! Two independent paths to the remote coordination service:
//!
//! - [`CloudPushTransport`] — persistent WebSocket, events arrive the
//!   instant they occur, self-heals with bounded exponential backoff.
//! - [`CloudPollTransport`] — fixed-interval HTTP fetch, the
//!   always-available fallback.
//!
//! Transports only do socket I/O and handler dispatch; merging into the
//! canonical order set is the reconciliation engine's job.

mod cloud_poll;
mod cloud_push;

pub use cloud_poll::CloudPollTransport;
pub use cloud_push::{CloudPushTransport, PushHandler};

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};

/// Queryable transport connection state, for the status indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

/// Lock-free cell holding a [`ConnectionState`]
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected as u8))
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::SeqCst) {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}
