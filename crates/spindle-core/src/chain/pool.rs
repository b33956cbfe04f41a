use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;
use thiserror::Error;
use tracing::{debug, debug_span, trace};

use super::builder::DefinitionInner;
use super::{ChainDefinition, ChainEvent, Directive, StageContext};
use crate::attributes::{AttributeHolder, AttributeRegistry};
use crate::error::{CoreError, codes};

/// 执行实例：游标 + 调用级属性。
struct ChainInstance {
    id: u64,
    cursor: usize,
    consecutive_reruns: u32,
    invocation: AttributeHolder,
}

impl ChainInstance {
    fn new(id: u64) -> Self {
        Self {
            id,
            cursor: 0,
            consecutive_reruns: 0,
            invocation: AttributeHolder::new(AttributeRegistry::shared()),
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.consecutive_reruns = 0;
        self.invocation.clear();
    }
}

struct PoolShared {
    definition: ChainDefinition,
    idle: Mutex<Vec<ChainInstance>>,
    created: AtomicU64,
    reused: AtomicU64,
    released: AtomicU64,
}

impl PoolShared {
    fn release(&self, mut instance: ChainInstance) {
        instance.reset();
        self.idle.lock().push(instance);
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// 池统计快照。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChainPoolStats {
    /// 新建实例数。
    pub created: u64,
    /// 命中空闲实例的次数。
    pub reused: u64,
    /// 归还次数。
    pub released: u64,
    /// 当前空闲实例数。
    pub idle: usize,
}

/// 处理链实例池。
///
/// # 教案级说明
/// - **意图 (Why)**：实例承载游标与调用级属性，构造成本虽低但在高并发下频繁分配会放大分配器压力，
///   因此以池复用；
/// - **逻辑 (How)**：空闲实例保存在 `spin::Mutex<Vec<_>>` 中，临界区只有一次 `push`/`pop`；
///   `acquire` 未命中时立即构造新实例，从不等待；
/// - **契约 (What)**：实例要么空闲在池中，要么被唯一的 [`ChainLease`] 持有，二者互斥；
///   互斥锁的加锁/解锁为“归还 → 下一次获取”提供 happens-before 边；池无容量上限；
/// - **权衡 (Trade-offs)**：后进先出有利于缓存局部性，但不保证公平；重复归还由所有权模型直接排除。
#[derive(Clone)]
pub struct ChainPool {
    shared: Arc<PoolShared>,
}

impl ChainPool {
    /// 为 `definition` 创建空池。
    pub fn new(definition: ChainDefinition) -> Self {
        debug!(chain = %definition.name(), stages = definition.len(), "chain.pool.created");
        Self {
            shared: Arc::new(PoolShared {
                definition,
                idle: Mutex::new(Vec::new()),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// 取出一个空闲实例，没有则新建。
    pub fn acquire(&self) -> ChainLease {
        let recycled = self.shared.idle.lock().pop();
        let instance = match recycled {
            Some(instance) => {
                self.shared.reused.fetch_add(1, Ordering::Relaxed);
                instance
            }
            None => {
                let id = self.shared.created.fetch_add(1, Ordering::Relaxed) + 1;
                ChainInstance::new(id)
            }
        };
        ChainLease {
            shared: Arc::clone(&self.shared),
            instance: Some(instance),
        }
    }

    /// 绑定的处理链定义。
    pub fn definition(&self) -> &ChainDefinition {
        &self.shared.definition
    }

    /// 当前空闲实例数。
    pub fn idle_len(&self) -> usize {
        self.shared.idle.lock().len()
    }

    pub fn stats(&self) -> ChainPoolStats {
        ChainPoolStats {
            created: self.shared.created.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
            released: self.shared.released.load(Ordering::Relaxed),
            idle: self.idle_len(),
        }
    }
}

impl fmt::Debug for ChainPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainPool")
            .field("chain", &self.shared.definition.name())
            .field("stats", &self.stats())
            .finish()
    }
}

/// 一轮执行的结果。
#[derive(Debug)]
pub enum ChainOutcome {
    /// 所有阶段都返回了 `Invoke`，游标越过末尾。
    Completed,
    /// 序号为 `stage` 的阶段返回了 `Stop`。
    Stopped { stage: usize },
    /// 链被挂起，租约交回调用方，恢复时从挂起阶段的下一个阶段继续。
    Suspended(ChainLease),
}

impl ChainOutcome {
    /// 折算回续行指令：完成视为 `Invoke`。
    pub fn directive(&self) -> Directive {
        match self {
            ChainOutcome::Completed => Directive::Invoke,
            ChainOutcome::Stopped { .. } => Directive::Stop,
            ChainOutcome::Suspended(_) => Directive::Suspend,
        }
    }
}

/// 阶段失败报告。
#[derive(Debug, Error)]
#[error("stage #{index} `{label}` of chain `{chain}` failed: {error}")]
pub struct StageFailure {
    chain: Arc<str>,
    index: usize,
    label: String,
    #[source]
    error: CoreError,
}

impl StageFailure {
    /// 失败阶段的序号。
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// 包装后的核心错误，错误码为 `chain.stage_failed`、`chain.stage_panicked` 或 `chain.rerun_limit`。
    pub fn error(&self) -> &CoreError {
        &self.error
    }

    pub fn into_error(self) -> CoreError {
        self.error
    }
}

impl From<StageFailure> for CoreError {
    fn from(value: StageFailure) -> Self {
        value.error
    }
}

enum Step {
    Completed,
    Stopped(usize),
    Suspended,
}

/// 签出的执行实例。
///
/// # 契约说明（What）
/// - `execute` 消费租约：完成、停止或失败时租约在返回前被丢弃，实例重置后回到池中；
/// - 挂起时租约随 [`ChainOutcome::Suspended`] 返回，调用方再次 `execute` 即恢复；
///   若调用方放弃恢复直接丢弃租约，实例同样被重置归还。
pub struct ChainLease {
    shared: Arc<PoolShared>,
    instance: Option<ChainInstance>,
}

impl ChainLease {
    /// 实例编号，从 1 开始，仅用于诊断。
    pub fn instance_id(&self) -> u64 {
        self.instance.as_ref().map_or(0, |instance| instance.id)
    }

    /// 下一次执行将从该序号的阶段开始。
    pub fn cursor(&self) -> usize {
        self.instance.as_ref().map_or(0, |instance| instance.cursor)
    }

    /// 调用级属性。
    pub fn invocation(&mut self) -> Option<&mut AttributeHolder> {
        self.instance.as_mut().map(|instance| &mut instance.invocation)
    }

    /// 从当前游标开始执行一轮。
    pub fn execute(
        mut self,
        event: ChainEvent,
        connection: &mut AttributeHolder,
    ) -> Result<ChainOutcome, StageFailure> {
        match self.run(event, connection)? {
            Step::Completed => Ok(ChainOutcome::Completed),
            Step::Stopped(stage) => Ok(ChainOutcome::Stopped { stage }),
            Step::Suspended => Ok(ChainOutcome::Suspended(self)),
        }
    }

    fn run(
        &mut self,
        mut event: ChainEvent,
        connection: &mut AttributeHolder,
    ) -> Result<Step, StageFailure> {
        let definition: &DefinitionInner = &self.shared.definition.inner;
        let Some(instance) = self.instance.as_mut() else {
            return Ok(Step::Completed);
        };
        let span = debug_span!(
            "chain.execute",
            chain = %definition.name,
            instance = instance.id,
            cursor = instance.cursor
        );
        let _entered = span.enter();
        let max_reruns = definition.settings.max_consecutive_reruns;

        while let Some(stage) = definition.stages.get(instance.cursor) {
            let index = instance.cursor;
            let mut ctx = StageContext {
                event: &mut event,
                connection: &mut *connection,
                invocation: &mut instance.invocation,
                stage_index: index,
                chain_name: &definition.name,
                instance_id: instance.id,
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| stage.process(&mut ctx)));
            let failure = |error: CoreError| StageFailure {
                chain: Arc::clone(&definition.name),
                index,
                label: stage.label().to_owned(),
                error,
            };
            match outcome {
                Ok(Ok(Directive::Invoke)) => {
                    instance.cursor += 1;
                    instance.consecutive_reruns = 0;
                }
                Ok(Ok(Directive::Rerun)) => {
                    instance.consecutive_reruns += 1;
                    trace!(stage = index, reruns = instance.consecutive_reruns, "chain.rerun");
                    if instance.consecutive_reruns > max_reruns {
                        return Err(failure(CoreError::new(
                            codes::CHAIN_RERUN_LIMIT,
                            format!("stage requested more than {max_reruns} consecutive reruns"),
                        )));
                    }
                }
                Ok(Ok(Directive::Stop)) => return Ok(Step::Stopped(index)),
                Ok(Ok(Directive::Suspend)) => {
                    instance.cursor += 1;
                    instance.consecutive_reruns = 0;
                    trace!(stage = index, "chain.suspended");
                    return Ok(Step::Suspended);
                }
                Ok(Err(error)) => {
                    let message = format!("stage returned `{}`: {}", error.code(), error.message());
                    return Err(failure(
                        CoreError::new(codes::CHAIN_STAGE_FAILED, message).with_cause(error),
                    ));
                }
                Err(payload) => {
                    return Err(failure(CoreError::new(
                        codes::CHAIN_STAGE_PANICKED,
                        format!("stage panicked: {}", panic_message(&*payload)),
                    )));
                }
            }
        }
        Ok(Step::Completed)
    }
}

impl Drop for ChainLease {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.shared.release(instance);
        }
    }
}

impl fmt::Debug for ChainLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainLease")
            .field("chain", &self.shared.definition.name())
            .field("instance", &self.instance_id())
            .field("cursor", &self.cursor())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainBuilder, EventKind, stage_fn};

    fn read_event() -> ChainEvent {
        ChainEvent::new(EventKind::Read)
    }

    #[test]
    fn suspend_keeps_lease_and_resumes_after_stage() {
        let pool = ChainBuilder::new("suspending")
            .stage(stage_fn("wait", |_| Ok(Directive::Suspend)))
            .stage(stage_fn("finish", |_| Ok(Directive::Invoke)))
            .build()
            .expect("构建")
            .pool();
        let mut connection = AttributeHolder::detached();

        let lease = pool.acquire();
        let outcome = lease.execute(read_event(), &mut connection).expect("执行");
        let ChainOutcome::Suspended(lease) = outcome else {
            panic!("应当挂起");
        };
        assert_eq!(lease.cursor(), 1);
        assert_eq!(pool.idle_len(), 0, "挂起的实例不得归还");

        let resumed = lease.execute(read_event(), &mut connection).expect("恢复");
        assert_eq!(resumed.directive(), Directive::Invoke);
        assert_eq!(pool.idle_len(), 1);
    }

    #[test]
    fn panicking_stage_is_reported_and_released() {
        let pool = ChainBuilder::new("fragile")
            .stage(stage_fn("boom", |_| panic!("decoder exploded")))
            .build()
            .expect("构建")
            .pool();
        let mut connection = AttributeHolder::detached();
        let failure = pool
            .acquire()
            .execute(read_event(), &mut connection)
            .expect_err("panic 应转为失败");
        assert_eq!(failure.index(), 0);
        assert_eq!(failure.label(), "boom");
        assert_eq!(failure.error().code(), codes::CHAIN_STAGE_PANICKED);
        assert!(failure.error().message().contains("decoder exploded"));
        assert_eq!(pool.stats().released, 1);
    }

    #[test]
    fn endless_rerun_hits_the_guard() {
        let pool = ChainBuilder::new("spinning")
            .stage(stage_fn("again", |_| Ok(Directive::Rerun)))
            .settings(crate::chain::ChainSettings {
                max_consecutive_reruns: 3,
            })
            .build()
            .expect("构建")
            .pool();
        let mut connection = AttributeHolder::detached();
        let failure = pool
            .acquire()
            .execute(read_event(), &mut connection)
            .expect_err("超出重试上限");
        assert_eq!(failure.error().code(), codes::CHAIN_RERUN_LIMIT);
    }
}
