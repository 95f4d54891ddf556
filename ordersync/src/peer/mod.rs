//! 局域网对等链路
//!
//! Internet outage resilience: the coordinator (POS) advertises itself
//! via mDNS and accepts raw TCP connections from followers (KDS/BDS/
//! manager devices) on the same network. Order events flow coordinator →
//! followers; the link carries the same [`SyncMessage`] vocabulary as
//! the cloud connection.
//!
//! Framing: 4-byte little-endian length prefix + UTF-8 JSON payload.
//!
//! There is deliberately no automatic reconnect on the follower side:
//! the coordinator may have gone away for good (device powered off), so
//! the operator decides when to re-discover.

mod coordinator;
mod follower;

pub use coordinator::PeerCoordinator;
pub use follower::{FollowerHandler, PeerFollower};

use shared::message::SyncMessage;
use shared::peer::PeerInfo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::utils::{SyncError, SyncResult};

/// Well-known peer link TCP port
pub const PEER_LINK_PORT: u16 = 3847;
/// mDNS service type advertised by the coordinator
pub const SERVICE_TYPE: &str = "_ordersync._tcp.local.";
/// mDNS instance name prefix
pub const SERVICE_NAME: &str = "ordersync";
/// Frames above this are a protocol violation, not a big order
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Coordinator-side connection lifecycle events
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connected(PeerInfo),
    Disconnected { client_id: String },
}

/// Read one length-prefixed frame; `Disconnected` on EOF
pub(crate) async fn read_frame<R>(reader: &mut R) -> SyncResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SyncError::Disconnected
        } else {
            SyncError::transport(format!("Frame header read failed: {e}"))
        }
    })?;

    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(SyncError::protocol(format!("Frame too large: {len} bytes")));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SyncError::Disconnected
        } else {
            SyncError::transport(format!("Frame body read failed: {e}"))
        }
    })?;

    Ok(payload)
}

/// Write one message as a length-prefixed frame
pub(crate) async fn write_frame<W>(writer: &mut W, msg: &SyncMessage) -> SyncResult<()>
where
    W: AsyncWrite + Unpin,
{
    let json = msg
        .to_json()
        .map_err(|e| SyncError::protocol(format!("Serialize failed: {e}")))?;
    let bytes = json.as_bytes();

    writer
        .write_all(&(bytes.len() as u32).to_le_bytes())
        .await
        .map_err(|e| SyncError::transport(format!("Frame header write failed: {e}")))?;
    writer
        .write_all(bytes)
        .await
        .map_err(|e| SyncError::transport(format!("Frame body write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| SyncError::transport(format!("Frame flush failed: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &SyncMessage::Ping).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let payload = read_frame(&mut cursor).await.unwrap();
        let msg = SyncMessage::from_json(std::str::from_utf8(&payload).unwrap()).unwrap();
        assert_eq!(msg, SyncMessage::Ping);
    }

    #[tokio::test]
    async fn test_eof_is_disconnect() {
        let mut cursor = std::io::Cursor::new(vec![1u8, 0]);
        match read_frame(&mut cursor).await {
            Err(SyncError::Disconnected) => {}
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = (u32::MAX).to_le_bytes().to_vec();
        buf.extend_from_slice(b"junk");
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(SyncError::Protocol(_))
        ));
    }
}
