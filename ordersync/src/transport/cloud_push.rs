//! Cloud Push transport — persistent WebSocket with self-healing reconnect
//!
//! 1. Connect WebSocket to the coordination service
//! 2. Flush the offline send queue, in order, right after connect
//! 3. Dispatch inbound messages to the registered handler
//! 4. Keepalive ping every 30s
//! 5. Reconnect with exponential backoff + jitter on unexpected close;
//!    budget of 10 attempts, then a terminal error until `connect()` is
//!    called again explicitly
//!
//! A clean, caller-initiated `disconnect()` cancels the loop at any
//! point — including mid-backoff — and never triggers a reconnect.

use futures::{SinkExt, StreamExt};
use shared::message::SyncMessage;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use super::{ConnectionState, StateCell};
use crate::utils::SyncError;

/// Reconnect attempt budget
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// Backoff base
const BACKOFF_BASE_SECS: u64 = 1;
/// Backoff cap (before jitter)
const BACKOFF_CAP_SECS: u64 = 30;
/// Jitter range added to every delay
const JITTER_MS: u64 = 1000;
/// WebSocket keepalive ping interval
const WS_PING_INTERVAL_SECS: u64 = 30;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Typed dispatch for cloud push events
pub trait PushHandler: Send + Sync + 'static {
    /// Connection established (queued sends have been flushed)
    fn on_connect(&self);
    /// Inbound protocol message
    fn on_message(&self, msg: SyncMessage);
    /// Connection lost (reconnect may follow)
    fn on_disconnect(&self);
    /// Reconnect budget exhausted; transport is idle until the next
    /// explicit `connect()`
    fn on_terminal(&self, err: SyncError);
}

struct Inner {
    url: String,
    state: StateCell,
    /// Offline FIFO: sends while disconnected queue here and flush in
    /// order after the next successful connect
    pending: tokio::sync::Mutex<VecDeque<SyncMessage>>,
    outbound: tokio::sync::Notify,
}

/// Cloud push transport
pub struct CloudPushTransport {
    inner: Arc<Inner>,
    cancel: StdMutex<Option<CancellationToken>>,
}

impl CloudPushTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                state: StateCell::new(),
                pending: tokio::sync::Mutex::new(VecDeque::new()),
                outbound: tokio::sync::Notify::new(),
            }),
            cancel: StdMutex::new(None),
        }
    }

    /// Open the connection and keep it alive until `disconnect()`
    ///
    /// A second `connect()` replaces any previous session, which also
    /// restarts the reconnect budget after a terminal error.
    pub fn connect(&self, tenant_id: &str, handler: Arc<dyn PushHandler>) {
        let token = CancellationToken::new();
        {
            let mut guard = self.cancel.lock().expect("cancel lock poisoned");
            if let Some(old) = guard.replace(token.clone()) {
                old.cancel();
            }
        }

        let inner = self.inner.clone();
        let tenant_id = tenant_id.to_string();
        tokio::spawn(async move {
            run_connect_loop(inner, tenant_id, handler, token).await;
        });
    }

    /// Clean shutdown; cancels mid-backoff waits and never reconnects
    pub fn disconnect(&self) {
        if let Some(token) = self.cancel.lock().expect("cancel lock poisoned").take() {
            token.cancel();
        }
        self.inner.state.set(ConnectionState::Disconnected);
    }

    /// Queue a message for delivery
    ///
    /// Never fails the caller: while disconnected the message waits in
    /// the in-memory FIFO and is flushed after the next connect.
    pub async fn send(&self, msg: SyncMessage) {
        self.inner.pending.lock().await.push_back(msg);
        self.inner.outbound.notify_one();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.get() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }
}

/// Whether another reconnect attempt fits in the budget
fn should_retry(attempt: u32) -> bool {
    attempt < MAX_RECONNECT_ATTEMPTS
}

/// Backoff delay for the nth consecutive failure (0-based):
/// `min(base * 2^n, cap) + jitter`
fn reconnect_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_SECS.saturating_mul(1u64 << attempt.min(6));
    let capped = exp.min(BACKOFF_CAP_SECS);
    let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 0..JITTER_MS);
    Duration::from_secs(capped) + Duration::from_millis(jitter)
}

async fn run_connect_loop(
    inner: Arc<Inner>,
    tenant_id: String,
    handler: Arc<dyn PushHandler>,
    cancel: CancellationToken,
) {
    let url = format!("{}?tenant_id={}", inner.url, tenant_id);
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        inner.state.set(ConnectionState::Connecting);
        match connect_async(&url).await {
            Ok((ws, _)) => {
                attempt = 0;
                inner.state.set(ConnectionState::Connected);
                tracing::info!(target: "cloud_push", "Connected to coordination service");
                handler.on_connect();

                let clean = run_session(&inner, ws, handler.as_ref(), &cancel).await;

                inner.state.set(ConnectionState::Disconnected);
                handler.on_disconnect();
                if clean {
                    break;
                }
            }
            Err(e) => {
                inner.state.set(ConnectionState::Disconnected);
                tracing::warn!(target: "cloud_push", "Connect failed: {e}");
            }
        }

        if cancel.is_cancelled() {
            break;
        }

        if !should_retry(attempt) {
            tracing::error!(
                target: "cloud_push",
                attempts = MAX_RECONNECT_ATTEMPTS,
                "Reconnect budget exhausted, giving up until next connect()"
            );
            handler.on_terminal(SyncError::ReconnectExhausted {
                attempts: MAX_RECONNECT_ATTEMPTS,
            });
            break;
        }

        let delay = reconnect_delay(attempt);
        attempt += 1;
        tracing::info!(
            target: "cloud_push",
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    inner.state.set(ConnectionState::Disconnected);
}

/// Run one WebSocket session; returns true on clean caller-initiated close
async fn run_session(
    inner: &Inner,
    ws: WsStream,
    handler: &dyn PushHandler,
    cancel: &CancellationToken,
) -> bool {
    let (mut sink, mut stream) = ws.split();

    if flush_pending(inner, &mut sink).await.is_err() {
        return false;
    }

    let mut ping = tokio::time::interval(Duration::from_secs(WS_PING_INTERVAL_SECS));
    ping.tick().await; // skip immediate tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                return true;
            }

            _ = inner.outbound.notified() => {
                if flush_pending(inner, &mut sink).await.is_err() {
                    return false;
                }
            }

            _ = ping.tick() => {
                if sink.send(Message::Ping(vec![].into())).await.is_err() {
                    tracing::warn!(target: "cloud_push", "Ping failed, disconnecting");
                    return false;
                }
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match SyncMessage::from_json(&text) {
                            Ok(m) => handler.on_message(m),
                            Err(e) => {
                                // Protocol errors drop the message, not the connection
                                tracing::warn!(
                                    target: "cloud_push",
                                    "Dropping unrecognized message: {e}"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!(target: "cloud_push", "Connection closed by server");
                        return false;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(target: "cloud_push", "Socket error: {e}");
                        return false;
                    }
                    _ => {} // Binary, Pong — ignore
                }
            }
        }
    }
}

/// Drain the offline FIFO into the socket, preserving order
async fn flush_pending<S>(inner: &Inner, sink: &mut S) -> Result<(), ()>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    loop {
        let next = inner.pending.lock().await.pop_front();
        let Some(msg) = next else {
            return Ok(());
        };

        let json = match msg.to_json() {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(target: "cloud_push", "Unserializable queued message: {e}");
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Text(json.into())).await {
            tracing::warn!(target: "cloud_push", "Send failed, requeueing: {e}");
            inner.pending.lock().await.push_front(msg);
            return Err(());
        }
    }
}
