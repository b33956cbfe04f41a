//! 传输层错误域。
//!
//! - **意图 (Why)**：传输实现（TCP/UDS/内存桩）与核心之间只交换这一种错误，避免核心感知 `std::io` 细节；
//! - **契约 (What)**：所有变体 `Clone + Send + Sync`，可随 [`ReadEvent::Failed`](crate::ReadEvent::Failed)
//!   跨线程投递；
//! - **风险 (Trade-offs)**：`detail` 使用 `String` 保存，换取可读性，牺牲极少量堆分配。

use thiserror::Error;

/// 传输实现上报的错误。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum TransportError {
    /// 连接已关闭，读写均不可继续。
    #[error("connection is closed")]
    Closed,

    /// 底层 I/O 失败。
    #[error("transport i/o failure: {detail}")]
    Io { detail: String },

    /// 传输拒绝了本次操作，例如写队列已满。
    #[error("transport rejected the operation: {reason}")]
    Rejected { reason: String },
}

impl TransportError {
    /// 由任意可显示对象构造 `Io` 变体，减少调用点的 `to_string` 样板。
    pub fn io(detail: impl core::fmt::Display) -> Self {
        TransportError::Io {
            detail: detail.to_string(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(value: std::io::Error) -> Self {
        TransportError::io(value)
    }
}
