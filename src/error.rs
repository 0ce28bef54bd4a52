//! 错误处理模块

use thiserror::Error;

/// NanoStream 库的统一错误类型
///
/// 会话的三类核心失败分别对应 `Connection`、`StreamInterrupted` 和
/// `IncompleteStream`，其余变体覆盖超时、解析和配置问题。
#[derive(Debug, Error)]
pub enum NanoError {
    /// 无法建立会话：网络、DNS、凭据被拒绝或非 2xx 状态码
    #[error("连接失败: {0}")]
    Connection(String),

    /// 会话在收到 `message_stop` 之前断开
    #[error("流被中断: {0}")]
    StreamInterrupted(String),

    /// 流异常结束，未能组装出最终消息
    #[error("流不完整: {0}")]
    IncompleteStream(String),

    /// 连接或空闲读取超时
    #[error("请求超时")]
    Timeout,

    /// JSON 序列化/反序列化错误
    #[error("JSON处理错误: {0}")]
    Json(String),

    /// 事件顺序或内容违反协议
    #[error("流处理错误: {0}")]
    StreamError(String),

    /// 请求参数无效
    #[error("请求参数无效: {0}")]
    InvalidRequest(String),

    /// 配置相关错误
    #[error("配置错误: {0}")]
    Config(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// NanoStream 库的 Result 类型别名
pub type Result<T> = std::result::Result<T, NanoError>;

impl NanoError {
    /// 是否为建立会话阶段的失败
    pub fn is_connection(&self) -> bool {
        matches!(self, NanoError::Connection(_))
    }

    /// 是否表示流在完成前终止
    pub fn is_stream_failure(&self) -> bool {
        matches!(
            self,
            NanoError::StreamInterrupted(_) | NanoError::IncompleteStream(_)
        )
    }

    /// 将发送阶段的 reqwest 错误归类
    pub(crate) fn from_send(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NanoError::Timeout
        } else {
            NanoError::Connection(e.to_string())
        }
    }
}

impl From<serde_json::Error> for NanoError {
    fn from(e: serde_json::Error) -> Self {
        NanoError::Json(e.to_string())
    }
}
