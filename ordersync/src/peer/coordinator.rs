//! 对等链路协调者（POS 端）
//!
//! Accepts follower TCP connections, advertises itself via mDNS, and
//! fans order events out to every registered follower. The handshake is
//! tenant-gated: a follower registering with a different tenant gets a
//! `tenant_mismatch` error and is dropped.
//!
//! Registration does not push a state snapshot by itself; the service
//! layer decides when a `sync_state` broadcast is due.

use dashmap::DashMap;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use shared::message::SyncMessage;
use shared::peer::{CoordinatorInfo, PeerInfo};
use shared::util::now_rfc3339;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{read_frame, write_frame, PeerEvent, SERVICE_NAME, SERVICE_TYPE};
use crate::utils::{SyncError, SyncResult};

/// Peer link coordinator
pub struct PeerCoordinator {
    tenant_id: String,
    port: u16,
    server_id: String,
    local_ip: Option<String>,
    clients: Arc<DashMap<String, PeerInfo>>,
    broadcast_tx: broadcast::Sender<SyncMessage>,
    events_tx: broadcast::Sender<PeerEvent>,
    /// Follower → coordinator traffic, tagged with the sender's client id
    inbound_tx: broadcast::Sender<(String, SyncMessage)>,
    running: Arc<AtomicBool>,
    mdns: StdMutex<Option<ServiceDaemon>>,
    cancel: StdMutex<Option<CancellationToken>>,
}

impl PeerCoordinator {
    pub fn new(tenant_id: impl Into<String>, port: u16) -> Self {
        let (broadcast_tx, _) = broadcast::channel(1000);
        let (events_tx, _) = broadcast::channel(100);
        let (inbound_tx, _) = broadcast::channel(1000);
        let local_ip = local_ip_address::local_ip().ok().map(|ip| ip.to_string());

        Self {
            tenant_id: tenant_id.into(),
            port,
            server_id: Uuid::new_v4().to_string(),
            local_ip,
            clients: Arc::new(DashMap::new()),
            broadcast_tx,
            events_tx,
            inbound_tx,
            running: Arc::new(AtomicBool::new(false)),
            mdns: StdMutex::new(None),
            cancel: StdMutex::new(None),
        }
    }

    /// Bind the listener, advertise via mDNS, and start accepting
    ///
    /// Returns the address followers can reach us on.
    pub async fn start(&self) -> SyncResult<String> {
        if self.running.load(Ordering::SeqCst) {
            return Err(SyncError::transport("Peer coordinator is already running"));
        }

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| SyncError::transport(format!("Failed to bind {addr}: {e}")))?;

        self.running.store(true, Ordering::SeqCst);

        // mDNS failure is non-fatal: followers can still connect by
        // explicit address
        if let Err(e) = self.register_mdns() {
            tracing::warn!(target: "peer", "mDNS registration failed: {e}");
        }

        let token = CancellationToken::new();
        {
            let mut guard = self.cancel.lock().expect("cancel lock poisoned");
            *guard = Some(token.clone());
        }

        let ctx = SessionContext {
            tenant_id: self.tenant_id.clone(),
            server_id: self.server_id.clone(),
            clients: self.clients.clone(),
            broadcast_tx: self.broadcast_tx.clone(),
            events_tx: self.events_tx.clone(),
            inbound_tx: self.inbound_tx.clone(),
        };
        let running = self.running.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,

                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                let ctx = ctx.clone();
                                let token = token.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, addr, ctx, token).await {
                                        tracing::warn!(target: "peer", "Connection error: {e}");
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::warn!(target: "peer", "Accept failed: {e}");
                            }
                        }
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            tracing::info!(target: "peer", "Coordinator stopped");
        });

        let host = self
            .local_ip
            .clone()
            .unwrap_or_else(|| "localhost".to_string());
        tracing::info!(target: "peer", port = self.port, "Coordinator listening");
        Ok(format!("{host}:{}", self.port))
    }

    fn register_mdns(&self) -> SyncResult<()> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| SyncError::transport(format!("mDNS daemon failed: {e}")))?;

        let host_name = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| SERVICE_NAME.to_string());

        let instance = format!(
            "{}-{}",
            SERVICE_NAME,
            &self.tenant_id[..8.min(self.tenant_id.len())]
        );

        let mut properties = HashMap::new();
        properties.insert("tenant".to_string(), self.tenant_id.clone());
        properties.insert("server_id".to_string(), self.server_id.clone());

        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &format!("{host_name}.local."),
            self.local_ip.as_deref().unwrap_or(""),
            self.port,
            properties,
        )
        .map_err(|e| SyncError::transport(format!("mDNS service info failed: {e}")))?;

        daemon
            .register(info)
            .map_err(|e| SyncError::transport(format!("mDNS register failed: {e}")))?;

        *self.mdns.lock().expect("mdns lock poisoned") = Some(daemon);
        tracing::info!(target: "peer", instance, port = self.port, "mDNS registered");
        Ok(())
    }

    /// Stop accepting, withdraw the mDNS advert, drop all followers
    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().expect("cancel lock poisoned").take() {
            token.cancel();
        }
        if let Some(daemon) = self.mdns.lock().expect("mdns lock poisoned").take() {
            let _ = daemon.shutdown();
        }
        self.running.store(false, Ordering::SeqCst);
        self.clients.clear();
    }

    /// Fan a message out to all connected followers
    ///
    /// Returns how many follower sessions received it. Zero followers is
    /// not an error.
    pub fn broadcast(&self, msg: SyncMessage) -> usize {
        self.broadcast_tx.send(msg).unwrap_or(0)
    }

    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.clients.iter().map(|e| e.value().clone()).collect()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    pub fn subscribe_inbound(&self) -> broadcast::Receiver<(String, SyncMessage)> {
        self.inbound_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }
}

impl Drop for PeerCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
struct SessionContext {
    tenant_id: String,
    server_id: String,
    clients: Arc<DashMap<String, PeerInfo>>,
    broadcast_tx: broadcast::Sender<SyncMessage>,
    events_tx: broadcast::Sender<PeerEvent>,
    inbound_tx: broadcast::Sender<(String, SyncMessage)>,
}

/// One follower session: handshake, then fan-out until either side closes
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: SessionContext,
    cancel: CancellationToken,
) -> SyncResult<()> {
    let (mut reader, mut writer) = stream.into_split();

    tracing::debug!(target: "peer", %addr, "New connection");

    // First frame must be a registration
    let payload = read_frame(&mut reader).await?;
    let text = std::str::from_utf8(&payload)
        .map_err(|e| SyncError::protocol(format!("Non-UTF8 frame: {e}")))?;
    let (device_type, client_tenant) = match SyncMessage::from_json(text) {
        Ok(SyncMessage::Register {
            device_type,
            tenant_id,
        }) => (device_type, tenant_id),
        Ok(other) => {
            return Err(SyncError::protocol(format!(
                "Expected register, got {other:?}"
            )));
        }
        Err(e) => return Err(SyncError::protocol(format!("Bad register frame: {e}"))),
    };

    if client_tenant != ctx.tenant_id {
        tracing::warn!(target: "peer", %addr, "Tenant mismatch, rejecting follower");
        write_frame(&mut writer, &SyncMessage::tenant_mismatch()).await?;
        return Ok(());
    }

    let client_id = Uuid::new_v4().to_string();
    let ack = SyncMessage::Registered {
        client_id: client_id.clone(),
        coordinator: CoordinatorInfo {
            server_id: ctx.server_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            connected_clients: ctx.clients.len(),
            server_time: now_rfc3339(),
        },
    };
    write_frame(&mut writer, &ack).await?;

    let info = PeerInfo {
        client_id: client_id.clone(),
        device_type,
        connected_at: now_rfc3339(),
        ip_address: addr.ip().to_string(),
    };
    ctx.clients.insert(client_id.clone(), info.clone());
    let _ = ctx.events_tx.send(PeerEvent::Connected(info));
    tracing::info!(
        target: "peer",
        client_id = %client_id,
        device_type = %device_type,
        "Follower registered"
    );

    // Writer is shared: the session loop writes broadcasts, the reader
    // task answers pings
    let writer = Arc::new(Mutex::new(writer));
    let mut broadcast_rx = ctx.broadcast_tx.subscribe();

    let mut read_task = tokio::spawn({
        let writer = writer.clone();
        let inbound_tx = ctx.inbound_tx.clone();
        let client_id = client_id.clone();
        async move {
            loop {
                let payload = match read_frame(&mut reader).await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let msg = match std::str::from_utf8(&payload)
                    .ok()
                    .and_then(|t| SyncMessage::from_json(t).ok())
                {
                    Some(m) => m,
                    None => {
                        // Drop the frame, keep the session
                        tracing::warn!(
                            target: "peer",
                            client_id = %client_id,
                            "Dropping unrecognized frame"
                        );
                        continue;
                    }
                };
                match msg {
                    SyncMessage::Ping => {
                        let _ = write_frame(&mut *writer.lock().await, &SyncMessage::Pong).await;
                    }
                    other => {
                        let _ = inbound_tx.send((client_id.clone(), other));
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = &mut read_task => break,

            Ok(msg) = broadcast_rx.recv() => {
                if write_frame(&mut *writer.lock().await, &msg).await.is_err() {
                    break;
                }
            }
        }
    }
    read_task.abort();

    ctx.clients.remove(&client_id);
    let _ = ctx.events_tx.send(PeerEvent::Disconnected {
        client_id: client_id.clone(),
    });
    tracing::info!(target: "peer", client_id = %client_id, "Follower disconnected");

    Ok(())
}
