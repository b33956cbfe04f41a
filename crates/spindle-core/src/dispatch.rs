//! 连接驱动：把读取器产出的完整消息送进处理链。
//!
//! # 教案级说明
//! - **意图 (Why)**：读取器、处理链池与工作线程资源各自独立，需要一个按连接持有状态的胶水层，
//!   负责“签出实例 → 执行 → 挂起或归还”；
//! - **逻辑 (How)**：[`ConnectionDriver`] 持有连接级属性与可选的挂起租约；每次执行都包在
//!   [`worker::run_unit`] 中，因此在工作线程上会登记事务时间，在普通线程上直接执行；
//! - **契约 (What)**：挂起时新到达的消息恢复原实例而不是签出新实例；阶段失败以 `warn!` 记录并返回给调用方，
//!   实例此时已归还池中。

use std::fmt;
use std::sync::Arc;

use spindle_buffer::CompositeBuffer;
use spindle_transport::ConnectionId;
use tracing::{trace, warn};

use crate::attributes::{AttributeHolder, AttributeRegistry};
use crate::chain::{ChainEvent, ChainLease, ChainOutcome, ChainPool, Directive, EventKind};
use crate::error::{CoreError, codes};
use crate::reader::ReadCompletion;
use crate::worker;

/// 每连接一个的处理链驱动。
pub struct ConnectionDriver {
    connection: ConnectionId,
    attributes: AttributeHolder,
    pool: ChainPool,
    suspended: Option<ChainLease>,
}

impl ConnectionDriver {
    pub fn new(connection: ConnectionId, pool: ChainPool) -> Self {
        Self {
            connection,
            attributes: AttributeHolder::new(AttributeRegistry::shared()),
            pool,
            suspended: None,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// 连接级属性。
    pub fn attributes(&self) -> &AttributeHolder {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut AttributeHolder {
        &mut self.attributes
    }

    pub fn pool(&self) -> &ChainPool {
        &self.pool
    }

    /// 是否有挂起中的实例。
    pub fn is_suspended(&self) -> bool {
        self.suspended.is_some()
    }

    /// 处理一条完整消息。
    ///
    /// 返回本轮的走向：跑完全部阶段为 `Invoke`，被阶段停止为 `Stop`，挂起为 `Suspend`。
    pub fn handle_message(&mut self, message: CompositeBuffer) -> Result<Directive, CoreError> {
        self.dispatch(ChainEvent::read(message))
    }

    /// 以外部事件恢复挂起的实例。
    pub fn resume(&mut self, event: ChainEvent) -> Result<Directive, CoreError> {
        if self.suspended.is_none() {
            return Err(CoreError::new(
                codes::CHAIN_NOT_SUSPENDED,
                format!("connection {} has no suspended chain", self.connection),
            ));
        }
        self.dispatch(event)
    }

    /// 连接关闭：放弃挂起的实例，以 `Close` 事件跑一轮，然后清空连接属性。
    pub fn close(&mut self) -> Result<Directive, CoreError> {
        self.suspended.take();
        let outcome = self.dispatch(ChainEvent::new(EventKind::Close));
        self.suspended.take();
        self.attributes.clear();
        outcome
    }

    fn dispatch(&mut self, event: ChainEvent) -> Result<Directive, CoreError> {
        let lease = match self.suspended.take() {
            Some(lease) => lease,
            None => self.pool.acquire(),
        };
        let kind = event.kind();
        let attributes = &mut self.attributes;
        let result = worker::run_unit(|| lease.execute(event, attributes));
        match result {
            Ok(ChainOutcome::Suspended(lease)) => {
                trace!(
                    connection = %self.connection,
                    cursor = lease.cursor(),
                    "dispatch.suspended"
                );
                self.suspended = Some(lease);
                Ok(Directive::Suspend)
            }
            Ok(outcome) => Ok(outcome.directive()),
            Err(failure) => {
                warn!(
                    connection = %self.connection,
                    chain = failure.chain(),
                    stage = failure.label(),
                    event = ?kind,
                    error = %failure.error(),
                    "dispatch.stage_failed"
                );
                Err(failure.into())
            }
        }
    }
}

impl fmt::Debug for ConnectionDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDriver")
            .field("connection", &self.connection)
            .field("chain", &self.pool.definition().name())
            .field("suspended", &self.suspended.is_some())
            .finish()
    }
}

/// 把读取器的完成通知转交给共享的 [`ConnectionDriver`]。
///
/// 驱动放在 `Arc<spin::Mutex<_>>` 中，传输线程与应用线程（例如主动 `close`）可以共同访问；
/// 执行失败与读取失败都累积在 `failures` 中，由调用方决定是否拆除连接。
pub struct DriverCompletion {
    driver: Arc<spin::Mutex<ConnectionDriver>>,
    failures: Vec<CoreError>,
}

impl DriverCompletion {
    pub fn new(driver: Arc<spin::Mutex<ConnectionDriver>>) -> Self {
        Self {
            driver,
            failures: Vec::new(),
        }
    }

    pub fn driver(&self) -> &Arc<spin::Mutex<ConnectionDriver>> {
        &self.driver
    }

    /// 已累积的失败数量。
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// 取走已累积的失败。
    pub fn take_failures(&mut self) -> Vec<CoreError> {
        std::mem::take(&mut self.failures)
    }
}

impl ReadCompletion for DriverCompletion {
    fn completed(&mut self, message: CompositeBuffer) {
        let result = self.driver.lock().handle_message(message);
        if let Err(error) = result {
            self.failures.push(error);
        }
    }

    fn failed(&mut self, error: CoreError) {
        self.failures.push(error);
    }
}

impl fmt::Debug for DriverCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverCompletion")
            .field("failures", &self.failures.len())
            .finish()
    }
}
