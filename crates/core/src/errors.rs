use std::time::Duration;

use thiserror::Error;

/// 消息队列客户端错误类型定义
///
/// 变体按照处理策略分组：连接/通道类错误属于瞬时故障，由连接池在本地重连恢复；
/// 拓扑错误在启动阶段是致命的；发布确认超时原样返回给调用方。
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("连接错误: {0}")]
    Connection(String),

    #[error("通道错误: {0}")]
    Channel(String),

    #[error("队列拓扑错误: 队列 {queue} - {message}")]
    Topology { queue: String, message: String },

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("处理器执行失败: 队列 {queue} - {message}")]
    Handler { queue: String, message: String },

    #[error("发布未在 {timeout:?} 内得到确认: {target}")]
    PublishNotConfirmed { target: String, timeout: Duration },

    #[error("发布失败: {target} - {message}")]
    Publish { target: String, message: String },

    #[error("队列 {queue} 的处理器重复注册")]
    DuplicateHandler { queue: String },

    #[error("无法解析队列 {queue} 的处理器: {message}")]
    HandlerResolution { queue: String, message: String },

    #[error("处理器注册表已经关闭")]
    RegistryClosed,

    #[error("等待积压排空超时 ({0:?})")]
    DrainTimeout(Duration),

    #[error("通道池已关闭")]
    PoolClosed,

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl CourierError {
    pub fn topology(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Topology {
            queue: queue.into(),
            message: message.into(),
        }
    }

    /// 是否属于可通过重连恢复的瞬时故障
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Channel(_))
    }
}

/// 统一的Result类型
pub type CourierResult<T> = std::result::Result<T, CourierError>;
