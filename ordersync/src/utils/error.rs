//! 统一错误处理
//!
//! 同步引擎的错误分类：
//!
//! | 分类 | 处理策略 |
//! |------|----------|
//! | `Transport` | 瞬时故障，由各传输自身的重试策略处理 |
//! | `Protocol` | 记录日志并丢弃消息，连接保持 |
//! | `ReconnectExhausted` | 终态，等待显式重连 |
//! | `Conflict` | 领域冲突，no-op + 警告，绝不向上抛异常 |
//! | `Cache` | 本地缓存读写失败 |

/// Application error for the sync engine
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ========== 瞬时传输错误 ==========
    #[error("Transport failure: {0}")]
    /// 连接/发送/抓取失败，按传输自身策略重试
    Transport(String),

    /// 对端关闭连接
    #[error("Peer disconnected")]
    Disconnected,

    // ========== 协议错误 ==========
    #[error("Protocol violation: {0}")]
    /// 非法/无法识别的消息，丢弃后连接保持
    Protocol(String),

    // ========== 终态传输错误 ==========
    #[error("Reconnect budget exhausted after {attempts} attempts")]
    /// 重连预算耗尽，直到显式 connect() 前不再重试
    ReconnectExhausted { attempts: u32 },

    // ========== 领域冲突 ==========
    #[error("Domain conflict: {0}")]
    /// 非法状态迁移、重复沽清标记等，以 no-op 解决
    Conflict(String),

    // ========== 系统错误 ==========
    #[error("Cache error: {0}")]
    /// 本地持久缓存读写失败
    Cache(String),

    #[error("Invalid configuration: {0}")]
    /// 配置错误
    Config(String),
}

// ========== Helper Constructors ==========

impl SyncError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        Self::Cache(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Convenience result alias
pub type SyncResult<T> = Result<T, SyncError>;
