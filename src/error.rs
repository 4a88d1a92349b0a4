// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 错误类型 (Error taxonomy)
//!
//! - Transport:   连接失败/断开/超时,终止会话
//! - Protocol:    机载端违反协议,终止会话
//! - Decode:      单帧图像损坏,丢弃当前帧后继续
//! - Persistence: 录像失败,只关闭录像

use crate::stream::types::WorkerState;

/// Result type alias
pub type Result<T> = std::result::Result<T, StreamError>;

/// 传输层错误
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// 无法建立连接
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// 对端关闭连接 (read 返回 0 字节)
    #[error("connection closed by peer")]
    Closed,

    /// 读超时
    #[error("read timed out")]
    Timeout,

    /// 其他 I/O 错误
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                TransportError::Timeout
            }
            std::io::ErrorKind::UnexpectedEof => TransportError::Closed,
            _ => TransportError::Io(err),
        }
    }
}

/// 视频流错误
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("image decode error: {0}")]
    Decode(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("operation not allowed in state {0:?}")]
    InvalidState(WorkerState),
}

impl StreamError {
    /// 只有单帧图像解码失败可以恢复
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StreamError::Decode(_))
    }

    /// 对端在帧边界处关闭连接
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, StreamError::Transport(TransportError::Closed))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Transport(TransportError::from(err))
    }
}
