use bytes::Bytes;
use core::fmt;
use futures::future::BoxFuture;

use crate::{Interceptor, TransportError};

/// 连接标识，仅用于日志、追踪与传输调用寻址。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// 以原始数值构造标识。
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// 原始数值。
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// 写出操作返回的 Future，完成时给出实际写出的字节数。
pub type WriteFuture = BoxFuture<'static, crate::Result<usize, TransportError>>;

/// 读方向的传输契约。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 真实选择器（epoll/kqueue 等价物）由外部实现，核心只需要“为某连接登记一个拦截器”的入口；
/// - 以拦截器而非回调嵌套表达增量读取，使核心的 `IncrementalReader` 可以直接挂接。
///
/// ## 契约说明（What）
/// - `read`：为 `connection` 登记 `interceptor`，随后异步投递零个或多个
///   [`ReadEvent`](crate::ReadEvent)，以 `EndOfStream`/`Failed` 或拦截器返回非 `wants_more` 标志终止；
/// - **前置条件**：同一连接同一时刻至多登记一个拦截器；
/// - **后置条件**：分片按到达顺序投递，传输层不得重排。
///
/// ## 风险提示（Trade-offs）
/// - 拦截器以 `Box<dyn Interceptor>` 传入，换取对象安全；高频路径上每条消息仅登记一次，开销可忽略。
pub trait TransportReader: Send + Sync + 'static {
    /// 为连接登记拦截器。
    fn read(&self, connection: ConnectionId, interceptor: Box<dyn Interceptor>);
}

/// 写方向的传输契约。
///
/// - **契约 (What)**：`write` 接管 `buffer` 的所有权并返回 [`WriteFuture`]；
///   Future 以写出字节数完成，或以 [`TransportError`] 失败；
/// - **风险 (Trade-offs)**：实现应保持方法非阻塞，排队与背压在 Future 内部处理。
pub trait TransportWriter: Send + Sync + 'static {
    /// 写出缓冲。
    fn write(&self, connection: ConnectionId, buffer: Bytes) -> WriteFuture;
}
