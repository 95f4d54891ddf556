//! 同步引擎配置
//!
//! # 环境变量
//!
//! | 环境变量 | 默认值 | 说明 |
//! |----------|--------|------|
//! | TENANT_ID | (必填) | 租户标识 |
//! | DEVICE_ROLE | poll-only | coordinator \| follower \| poll-only |
//! | DEVICE_TYPE | pos | pos \| kds \| bds \| manager |
//! | CLOUD_WS_URL | wss://localhost:8443/ws/orders | 云推送 WebSocket 地址 |
//! | CLOUD_POLL_URL | https://localhost:8443/api/orders | 云轮询 HTTP 地址 |
//! | POLL_INTERVAL_SECS | 10 | 轮询间隔（秒） |
//! | PEER_PORT | 3847 | 局域网对等链路端口 |
//! | ENABLE_CLOUD_PUSH | true | 启用云推送传输 |
//! | ENABLE_CLOUD_POLL | true | 启用云轮询传输 |
//! | ENABLE_PEER_LINK | true | 启用局域网对等链路 |
//! | LOG_LEVEL | info | 日志级别 |
//! | LOG_DIR | (无) | 日志文件目录 |

use shared::peer::DeviceType;

use crate::utils::SyncError;

/// Which side of the peer link this device plays, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    /// POS terminal: accepts follower connections and broadcasts
    Coordinator,
    /// Kitchen/bump screen: discovers and connects to the coordinator
    Follower,
    /// Handheld with cloud access only
    PollOnly,
}

impl std::str::FromStr for DeviceRole {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "coordinator" => Ok(Self::Coordinator),
            "follower" => Ok(Self::Follower),
            "poll-only" | "poll_only" => Ok(Self::PollOnly),
            other => Err(SyncError::config(format!("Unknown device role: {other}"))),
        }
    }
}

/// Sync engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// 租户标识（由已认证会话提供）
    pub tenant_id: String,
    /// 设备角色
    pub device_role: DeviceRole,
    /// 设备类型（对等链路注册时上报）
    pub device_type: DeviceType,
    /// 云推送 WebSocket 地址
    pub cloud_ws_url: String,
    /// 云轮询 HTTP 地址
    pub cloud_poll_url: String,
    /// 轮询间隔（秒）
    pub poll_interval_secs: u64,
    /// 对等链路 TCP 端口
    pub peer_port: u16,
    /// 传输开关
    pub enable_cloud_push: bool,
    pub enable_cloud_poll: bool,
    pub enable_peer_link: bool,
    /// 日志级别
    pub log_level: String,
    /// 日志文件目录（可选）
    pub log_dir: Option<String>,
}

impl Config {
    /// 从环境变量加载配置，未设置的项使用默认值
    pub fn from_env() -> Result<Self, SyncError> {
        let tenant_id = std::env::var("TENANT_ID")
            .map_err(|_| SyncError::config("TENANT_ID is required"))?;

        let device_role = std::env::var("DEVICE_ROLE")
            .unwrap_or_else(|_| "poll-only".into())
            .parse()?;

        let device_type = match std::env::var("DEVICE_TYPE")
            .unwrap_or_else(|_| "pos".into())
            .to_lowercase()
            .as_str()
        {
            "pos" => DeviceType::Pos,
            "kds" => DeviceType::Kds,
            "bds" => DeviceType::Bds,
            "manager" => DeviceType::Manager,
            other => {
                return Err(SyncError::config(format!("Unknown device type: {other}")));
            }
        };

        Ok(Self {
            tenant_id,
            device_role,
            device_type,
            cloud_ws_url: std::env::var("CLOUD_WS_URL")
                .unwrap_or_else(|_| "wss://localhost:8443/ws/orders".into()),
            cloud_poll_url: std::env::var("CLOUD_POLL_URL")
                .unwrap_or_else(|_| "https://localhost:8443/api/orders".into()),
            poll_interval_secs: std::env::var("POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            peer_port: std::env::var("PEER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(crate::peer::PEER_LINK_PORT),
            enable_cloud_push: env_flag("ENABLE_CLOUD_PUSH", true),
            enable_cloud_poll: env_flag("ENABLE_CLOUD_POLL", true),
            enable_peer_link: env_flag("ENABLE_PEER_LINK", true),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            log_dir: std::env::var("LOG_DIR").ok(),
        })
    }

    /// Test/demo configuration for a given tenant
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            device_role: DeviceRole::PollOnly,
            device_type: DeviceType::Pos,
            cloud_ws_url: "wss://localhost:8443/ws/orders".into(),
            cloud_poll_url: "https://localhost:8443/api/orders".into(),
            poll_interval_secs: 10,
            peer_port: crate::peer::PEER_LINK_PORT,
            enable_cloud_push: true,
            enable_cloud_poll: true,
            enable_peer_link: true,
            log_level: "info".into(),
            log_dir: None,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_role_parsing() {
        assert_eq!(
            "coordinator".parse::<DeviceRole>().unwrap(),
            DeviceRole::Coordinator
        );
        assert_eq!(
            "POLL-ONLY".parse::<DeviceRole>().unwrap(),
            DeviceRole::PollOnly
        );
        assert!("printer".parse::<DeviceRole>().is_err());
    }
}
