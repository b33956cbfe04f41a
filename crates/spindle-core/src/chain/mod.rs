//! 处理链：有序阶段 + 显式续行指令 + 实例池。
//!
//! # 教案级导览
//!
//! ## 意图（Why）
//! - 连接上的每个事件都要流经一组有序阶段（帧解析、协议解码、业务逻辑），阶段之间需要共享上下文，
//!   并能表达“停止 / 继续 / 重试当前阶段 / 挂起等待外部事件”四种走向；
//! - 热路径上不能为每个事件新建执行单元，因此结构（阶段列表）与执行状态（游标、调用级属性）分离，
//!   后者由 [`ChainPool`] 复用。
//!
//! ## 结构（How）
//! - [`ChainBuilder`] 按注册顺序收集阶段，产出不可变、`Arc` 共享的 [`ChainDefinition`]；
//! - [`ChainPool`] 以 `spin::Mutex<Vec<_>>` 保存空闲实例（后进先出），`acquire` 从不阻塞；
//! - [`ChainLease`] 是签出的实例，`execute` 消费租约：运行完毕、停止或失败时租约被丢弃并自动归还，
//!   挂起时租约随 [`ChainOutcome::Suspended`] 交回调用方，直到恢复；
//! - 每个阶段通过 [`StageContext`] 访问事件、连接级属性、调用级属性与当前线程的工作资源。
//!
//! ## 契约（What）
//! - 单轮执行严格按注册顺序推进，`Rerun` 只重复当前阶段，不回溯；
//! - 阶段返回错误或 panic 视为本轮的终止性失败，剩余阶段被跳过，实例归还池中；
//! - 归还前实例被重置：游标回到首个阶段，调用级属性全部清空，连接级属性不受影响。

mod builder;
mod pool;
mod stage;

pub use builder::{ChainBuilder, ChainDefinition};
pub use pool::{ChainLease, ChainOutcome, ChainPool, ChainPoolStats, StageFailure};
pub use stage::{FnStage, Stage, StageContext, stage_fn};

pub use crate::configuration::ChainSettings;

use spindle_buffer::CompositeBuffer;

/// 阶段返回的续行指令。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Directive {
    /// 停止本轮执行并向上报告完成，例如连接正在拆除。
    Stop,
    /// 立即进入下一个阶段。
    Invoke,
    /// 再次执行当前阶段，游标不前进。
    Rerun,
    /// 挂起整条链，等待外部事件恢复；实例保持签出。
    Suspend,
}

/// 事件类别。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    Accept,
    Connect,
    Read,
    Write,
    Close,
}

/// 交给一轮执行的事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainEvent {
    kind: EventKind,
    payload: Option<CompositeBuffer>,
}

impl ChainEvent {
    /// 不带负载的事件。
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: None,
        }
    }

    /// 携带完整消息的读事件。
    pub fn read(message: CompositeBuffer) -> Self {
        Self::new(EventKind::Read).with_payload(message)
    }

    /// 附加负载。
    pub fn with_payload(mut self, payload: CompositeBuffer) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> Option<&CompositeBuffer> {
        self.payload.as_ref()
    }

    pub fn payload_mut(&mut self) -> Option<&mut CompositeBuffer> {
        self.payload.as_mut()
    }

    /// 取走负载，之后的阶段看到 `None`。
    pub fn take_payload(&mut self) -> Option<CompositeBuffer> {
        self.payload.take()
    }
}
