#![deny(unsafe_code)]
#![doc = "spindle-core: 非阻塞连接处理核心。"]
#![doc = ""]
#![doc = "== 组成 =="]
#![doc = "- `attributes`：注册表分配的整数槽位 + 按对象持有的取值数组，让任意层在连接、线程、执行上下文上附加类型化状态。"]
#![doc = "- `chain`：有序阶段组成的处理链与可复用执行实例池，阶段以 `Directive` 显式控制流向。"]
#![doc = "- `reader`：把任意边界的分片累积为完整消息，并接到传输层拦截协议或 `crossbeam-channel` 上。"]
#![doc = "- `worker`：线程独占的竞技场、对象缓存、线程属性与事务簿记，以及固定规模的工作线程池。"]
#![doc = "- `session`：以比较交换守护每条边的会话状态格与监听者分发。"]
#![doc = "- `dispatch`：按连接把完整消息送入处理链，处理挂起与恢复。"]
#![doc = ""]
#![doc = "== 环境约定 =="]
#![doc = "库本身不安装任何 `tracing` 订阅者；配置以 `serde` + `toml` 解析，错误统一收敛为带稳定错误码的 [`CoreError`]。"]

/// 核心统一返回别名，错误类型默认为 [`CoreError`]。
pub type Result<T, E = CoreError> = core::result::Result<T, E>;

pub mod attributes;
pub mod chain;
pub mod configuration;
pub mod dispatch;
pub mod error;
pub mod reader;
pub mod session;
pub mod time;
pub mod worker;

pub use attributes::{Attribute, AttributeError, AttributeHolder, AttributeRegistry};
pub use chain::{
    ChainBuilder, ChainDefinition, ChainEvent, ChainLease, ChainOutcome, ChainPool, Directive,
    EventKind, Stage, StageContext,
};
pub use configuration::{ConfigError, CoreSettings};
pub use dispatch::{ConnectionDriver, DriverCompletion};
pub use error::{CoreError, ErrorCategory, codes};
pub use reader::{AtLeast, CompletionPredicate, IncrementalReader, ReadCompletion, ReadProgress};
pub use session::{ProtocolHandler, Session, SessionError, SessionListener, SessionState};
pub use worker::{WorkerPool, WorkerResources};
