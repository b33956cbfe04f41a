#![deny(unsafe_code)]
#![doc = "spindle-transport: 传输层契约接口统一抽象层。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：核心流水线不实现 epoll/kqueue 等选择器，只通过本 crate 声明的契约接收原始分片、写出缓冲。"]
#![doc = "- **What**：定义 `Interceptor` 拦截协议、`ReadEvent` 事件、`TransportReader`/`TransportWriter` 以及 `ConnectionId`。"]
#![doc = "- **How**：契约保持运行时无关，写出结果以 `futures` 的 `BoxFuture` 表达，实现方可挂接任意执行器。"]

/// `Result` 是传输层契约内部使用的统一返回别名，避免直接依赖 `spindle-core` 造成循环引用。
///
/// - 与 `core::result::Result` 完全等价，错误类型默认为 [`TransportError`]；
/// - 上层若需要转换为 `spindle-core::Result`，可直接依赖 `From<TransportError> for CoreError`。
pub type Result<T, E = TransportError> = core::result::Result<T, E>;

pub mod connection;
pub mod error;
pub mod intercept;

pub use connection::{ConnectionId, TransportReader, TransportWriter, WriteFuture};
pub use error::TransportError;
pub use intercept::{Intercept, Interceptor, ReadEvent};
