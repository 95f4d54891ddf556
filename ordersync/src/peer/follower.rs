//! 对等链路跟随者（KDS/BDS/管理端）
//!
//! Discovers the coordinator via mDNS, connects over TCP, registers, and
//! receives order broadcasts. Keeps the link alive with a 30s ping.
//!
//! On connection loss the follower reports and stays down — no automatic
//! reconnect.

use mdns_sd::{ServiceDaemon, ServiceEvent};
use shared::message::SyncMessage;
use shared::peer::{CoordinatorInfo, DeviceType, DiscoveredPeer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{read_frame, write_frame, PEER_LINK_PORT, SERVICE_TYPE};
use crate::utils::{SyncError, SyncResult};

/// Default mDNS browse window
const DISCOVER_TIMEOUT_SECS: u64 = 5;
/// Keep-alive ping interval
const PING_INTERVAL_SECS: u64 = 30;

/// Typed dispatch for follower-side events
pub trait FollowerHandler: Send + Sync + 'static {
    fn on_message(&self, msg: SyncMessage);
    /// Link lost; the follower will not reconnect on its own
    fn on_disconnect(&self);
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Peer link follower
pub struct PeerFollower {
    device_type: DeviceType,
    tenant_id: String,
    connected: Arc<AtomicBool>,
    client_id: StdMutex<Option<String>>,
    coordinator: StdMutex<Option<CoordinatorInfo>>,
    writer: StdMutex<Option<SharedWriter>>,
    cancel: StdMutex<Option<CancellationToken>>,
}

impl PeerFollower {
    pub fn new(device_type: DeviceType, tenant_id: impl Into<String>) -> Self {
        Self {
            device_type,
            tenant_id: tenant_id.into(),
            connected: Arc::new(AtomicBool::new(false)),
            client_id: StdMutex::new(None),
            coordinator: StdMutex::new(None),
            writer: StdMutex::new(None),
            cancel: StdMutex::new(None),
        }
    }

    /// Browse mDNS for coordinators, optionally filtered by tenant
    pub async fn discover(
        tenant_id: Option<&str>,
        timeout: Duration,
    ) -> SyncResult<Vec<DiscoveredPeer>> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| SyncError::transport(format!("mDNS daemon failed: {e}")))?;
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| SyncError::transport(format!("mDNS browse failed: {e}")))?;

        let mut peers = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,

                event = tokio::task::spawn_blocking({
                    let receiver = receiver.clone();
                    move || receiver.recv_timeout(Duration::from_millis(100))
                }) => {
                    if let Ok(Ok(ServiceEvent::ServiceResolved(info))) = event {
                        let peer_tenant = info
                            .get_property_val_str("tenant")
                            .map(|s| s.to_string());

                        if let Some(filter) = tenant_id {
                            if peer_tenant.as_deref() != Some(filter) {
                                continue;
                            }
                        }

                        if let Some(addr) = info.get_addresses().iter().next() {
                            peers.push(DiscoveredPeer {
                                name: info.get_fullname().to_string(),
                                ip_address: addr.to_string(),
                                port: info.get_port(),
                                tenant_id: peer_tenant,
                            });
                        }
                    }
                }
            }
        }

        let _ = daemon.shutdown();
        Ok(peers)
    }

    /// Connect to a coordinator at `host[:port]` and register
    pub async fn connect(
        &self,
        address: &str,
        handler: Arc<dyn FollowerHandler>,
    ) -> SyncResult<CoordinatorInfo> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transport("Already connected to a coordinator"));
        }

        let addr = if address.contains(':') {
            address.to_string()
        } else {
            format!("{address}:{PEER_LINK_PORT}")
        };

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| SyncError::transport(format!("Failed to connect {addr}: {e}")))?;
        let (mut reader, mut writer) = stream.into_split();

        let register = SyncMessage::Register {
            device_type: self.device_type,
            tenant_id: self.tenant_id.clone(),
        };
        write_frame(&mut writer, &register).await?;

        let payload = read_frame(&mut reader).await?;
        let text = std::str::from_utf8(&payload)
            .map_err(|e| SyncError::protocol(format!("Non-UTF8 frame: {e}")))?;
        let (client_id, coordinator) = match SyncMessage::from_json(text) {
            Ok(SyncMessage::Registered {
                client_id,
                coordinator,
            }) => (client_id, coordinator),
            Ok(SyncMessage::Error { message, code }) => {
                return Err(SyncError::protocol(format!(
                    "Registration rejected: {message} ({})",
                    code.unwrap_or_default()
                )));
            }
            Ok(other) => {
                return Err(SyncError::protocol(format!(
                    "Unexpected registration reply: {other:?}"
                )));
            }
            Err(e) => return Err(SyncError::protocol(format!("Bad registration reply: {e}"))),
        };

        tracing::info!(
            target: "peer",
            client_id = %client_id,
            coordinator = %coordinator.server_id,
            "Registered with coordinator"
        );

        let writer = Arc::new(Mutex::new(writer));
        let token = CancellationToken::new();

        *self.client_id.lock().expect("client_id lock poisoned") = Some(client_id);
        *self.coordinator.lock().expect("coordinator lock poisoned") = Some(coordinator.clone());
        *self.writer.lock().expect("writer lock poisoned") = Some(writer.clone());
        {
            let mut guard = self.cancel.lock().expect("cancel lock poisoned");
            if let Some(old) = guard.replace(token.clone()) {
                old.cancel();
            }
        }
        self.connected.store(true, Ordering::SeqCst);

        let connected = self.connected.clone();
        tokio::spawn(async move {
            let mut read_task = tokio::spawn({
                let handler = handler.clone();
                async move {
                    loop {
                        let payload = match read_frame(&mut reader).await {
                            Ok(p) => p,
                            Err(_) => break,
                        };
                        match std::str::from_utf8(&payload)
                            .ok()
                            .and_then(|t| SyncMessage::from_json(t).ok())
                        {
                            Some(SyncMessage::Pong) => {}
                            Some(msg) => handler.on_message(msg),
                            None => {
                                tracing::warn!(target: "peer", "Dropping unrecognized frame");
                            }
                        }
                    }
                }
            });

            let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
            ping.tick().await; // skip immediate tick

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,

                    _ = &mut read_task => break,

                    _ = ping.tick() => {
                        if write_frame(&mut *writer.lock().await, &SyncMessage::Ping)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            read_task.abort();

            connected.store(false, Ordering::SeqCst);
            handler.on_disconnect();
            tracing::info!(target: "peer", "Coordinator link closed");
        });

        Ok(coordinator)
    }

    /// Discover and connect to the first same-tenant coordinator
    ///
    /// `Ok(None)` means nothing answered the browse window.
    pub async fn auto_connect(
        &self,
        handler: Arc<dyn FollowerHandler>,
    ) -> SyncResult<Option<CoordinatorInfo>> {
        let peers = Self::discover(
            Some(&self.tenant_id),
            Duration::from_secs(DISCOVER_TIMEOUT_SECS),
        )
        .await?;

        let Some(peer) = peers.into_iter().next() else {
            tracing::info!(target: "peer", "No coordinator found on the local network");
            return Ok(None);
        };

        let addr = format!("{}:{}", peer.ip_address, peer.port);
        let info = self.connect(&addr, handler).await?;
        Ok(Some(info))
    }

    /// Send a message up to the coordinator
    pub async fn send(&self, msg: &SyncMessage) -> SyncResult<()> {
        let writer = self
            .writer
            .lock()
            .expect("writer lock poisoned")
            .clone()
            .ok_or(SyncError::Disconnected)?;
        let mut guard = writer.lock().await;
        write_frame(&mut *guard, msg).await
    }

    pub fn disconnect(&self) {
        if let Some(token) = self.cancel.lock().expect("cancel lock poisoned").take() {
            token.cancel();
        }
        self.connected.store(false, Ordering::SeqCst);
        *self.client_id.lock().expect("client_id lock poisoned") = None;
        *self.coordinator.lock().expect("coordinator lock poisoned") = None;
        *self.writer.lock().expect("writer lock poisoned") = None;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id
            .lock()
            .expect("client_id lock poisoned")
            .clone()
    }

    pub fn coordinator_info(&self) -> Option<CoordinatorInfo> {
        self.coordinator
            .lock()
            .expect("coordinator lock poisoned")
            .clone()
    }
}
