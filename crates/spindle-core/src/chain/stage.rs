use std::fmt;

use spindle_buffer::CompositeBuffer;

use super::{ChainEvent, Directive};
use crate::attributes::AttributeHolder;
use crate::error::CoreError;
use crate::worker::{self, WorkerResources};

/// 处理链中的一个阶段。
///
/// # 契约说明（What）
/// - `process` 同步执行，返回 [`Directive`] 决定链的走向；返回 `Err` 终止本轮并把实例归还池中；
/// - 阶段对象在所有实例之间共享，因此签名为 `&self`；每轮的可变状态应放进
///   [`StageContext::invocation`]（随实例复用、归还时清空）或 [`StageContext::connection`]（随连接存活）；
/// - `label` 用于日志与失败报告，默认取类型名。
pub trait Stage: Send + Sync + 'static {
    /// 诊断标签。
    fn label(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// 处理一次事件。
    fn process(&self, ctx: &mut StageContext<'_>) -> Result<Directive, CoreError>;
}

/// 闭包阶段，由 [`stage_fn`] 构造。
pub struct FnStage<F> {
    label: &'static str,
    handler: F,
}

/// 以闭包构造阶段。
///
/// ```rust
/// use spindle_core::chain::{ChainBuilder, Directive, stage_fn};
///
/// let chain = ChainBuilder::new("echo")
///     .stage(stage_fn("pass", |_ctx| Ok(Directive::Invoke)))
///     .build()
///     .expect("非空链");
/// assert_eq!(chain.labels().collect::<Vec<_>>(), ["pass"]);
/// ```
pub fn stage_fn<F>(label: &'static str, handler: F) -> FnStage<F>
where
    F: Fn(&mut StageContext<'_>) -> Result<Directive, CoreError> + Send + Sync + 'static,
{
    FnStage { label, handler }
}

impl<F> Stage for FnStage<F>
where
    F: Fn(&mut StageContext<'_>) -> Result<Directive, CoreError> + Send + Sync + 'static,
{
    fn label(&self) -> &str {
        self.label
    }

    fn process(&self, ctx: &mut StageContext<'_>) -> Result<Directive, CoreError> {
        (self.handler)(ctx)
    }
}

impl<F> fmt::Debug for FnStage<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage").field("label", &self.label).finish()
    }
}

/// 单轮执行中交给阶段的视图。
pub struct StageContext<'a> {
    pub(super) event: &'a mut ChainEvent,
    pub(super) connection: &'a mut AttributeHolder,
    pub(super) invocation: &'a mut AttributeHolder,
    pub(super) stage_index: usize,
    pub(super) chain_name: &'a str,
    pub(super) instance_id: u64,
}

impl StageContext<'_> {
    pub fn event(&self) -> &ChainEvent {
        &*self.event
    }

    pub fn event_mut(&mut self) -> &mut ChainEvent {
        &mut *self.event
    }

    /// 取走事件负载。
    pub fn take_payload(&mut self) -> Option<CompositeBuffer> {
        self.event.take_payload()
    }

    /// 连接级属性，跨轮次保留。
    pub fn connection(&mut self) -> &mut AttributeHolder {
        &mut *self.connection
    }

    /// 调用级属性，实例归还时清空。
    pub fn invocation(&mut self) -> &mut AttributeHolder {
        &mut *self.invocation
    }

    /// 当前阶段的序号（从 0 开始）。
    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    pub fn chain_name(&self) -> &str {
        self.chain_name
    }

    /// 执行实例编号。
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// 访问当前线程安装的工作资源；未安装时返回 `None`。
    pub fn with_worker<R>(&self, f: impl FnOnce(&mut WorkerResources) -> R) -> Option<R> {
        worker::with_current(f)
    }
}

impl fmt::Debug for StageContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("chain", &self.chain_name)
            .field("instance", &self.instance_id)
            .field("stage", &self.stage_index)
            .field("event", &self.event.kind())
            .finish()
    }
}
