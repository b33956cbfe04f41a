use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use spindle_buffer::{SizeClass, ThreadArena};

use super::cache::{CachedType, ObjectCache};
use crate::attributes::{AttributeHolder, AttributeRegistry};
use crate::configuration::WorkerSettings;
use crate::time::{Clock, SystemClock};

/// 线程属性使用的注册表，与连接/处理链上下文的共享注册表相互独立。
pub fn thread_attributes() -> &'static AttributeRegistry {
    static THREAD: OnceLock<AttributeRegistry> = OnceLock::new();
    THREAD.get_or_init(AttributeRegistry::new)
}

const IDLE: u64 = 0;
const UNLIMITED: u64 = u64::MAX;

struct ProbeState {
    worker_name: Arc<str>,
    anchor: Instant,
    /// 相对 `anchor` 的纳秒偏移 + 1；`IDLE` 表示空闲。
    started: AtomicU64,
    /// 超时纳秒；`UNLIMITED` 表示不限。
    timeout: AtomicU64,
}

/// 供外部看门狗读取的事务探针。
///
/// # 教案级说明
/// - **意图 (Why)**：工作线程本身不强制超时，只登记“事务何时开始”；看门狗线程需要在不打扰工作线程的前提下
///   读取这一信息，判断线程是否停滞；
/// - **逻辑 (How)**：起始时间以相对锚点的纳秒偏移存放在 `AtomicU64` 中，`0` 代表空闲；
///   写端使用 `Release`，读端使用 `Acquire`；
/// - **契约 (What)**：探针可被任意线程克隆与读取；只有宿主线程通过 [`WorkerResources`] 写入。
#[derive(Clone)]
pub struct TransactionProbe {
    state: Arc<ProbeState>,
}

impl TransactionProbe {
    fn new(worker_name: Arc<str>, anchor: Instant, timeout: Option<Duration>) -> Self {
        let probe = Self {
            state: Arc::new(ProbeState {
                worker_name,
                anchor,
                started: AtomicU64::new(IDLE),
                timeout: AtomicU64::new(UNLIMITED),
            }),
        };
        probe.set_timeout(timeout);
        probe
    }

    pub fn worker_name(&self) -> &str {
        &self.state.worker_name
    }

    /// 当前事务的起始时间；空闲时为 `None`。
    pub fn started_at(&self) -> Option<Instant> {
        match self.state.started.load(Ordering::Acquire) {
            IDLE => None,
            offset => Some(self.state.anchor + Duration::from_nanos(offset - 1)),
        }
    }

    /// 截至 `now` 的事务耗时。
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.started_at()
            .map(|started| now.saturating_duration_since(started))
    }

    /// 事务超时；`None` 表示不限。
    pub fn timeout(&self) -> Option<Duration> {
        match self.state.timeout.load(Ordering::Acquire) {
            UNLIMITED => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    /// 事务耗时是否已超过超时；空闲或不限时恒为 `false`。
    pub fn is_stalled(&self, now: Instant) -> bool {
        match (self.elapsed(now), self.timeout()) {
            (Some(elapsed), Some(timeout)) => elapsed > timeout,
            _ => false,
        }
    }

    fn begin(&self, now: Instant) {
        let offset = now.saturating_duration_since(self.state.anchor).as_nanos();
        let encoded = u64::try_from(offset).unwrap_or(u64::MAX - 1).saturating_add(1);
        self.state.started.store(encoded, Ordering::Release);
    }

    fn end(&self) {
        self.state.started.store(IDLE, Ordering::Release);
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        let encoded = timeout
            .map(|timeout| u64::try_from(timeout.as_nanos()).unwrap_or(UNLIMITED - 1))
            .unwrap_or(UNLIMITED);
        self.state.timeout.store(encoded, Ordering::Release);
    }
}

impl fmt::Debug for TransactionProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionProbe")
            .field("worker", &self.worker_name())
            .field("started_at", &self.started_at())
            .field("timeout", &self.timeout())
            .finish()
    }
}

/// 工作线程独占的资源集合：内存竞技场、对象缓存、线程属性与事务簿记。
///
/// # 教案级说明
/// - **意图 (Why)**：阶段在工作线程上执行时需要临时缓冲与草稿对象；按线程独占可以完全避免锁，
///   同时不必为每个请求分配；
/// - **逻辑 (How)**：资源通过 [`install`](super::install) 放入线程本地槽位，阶段经
///   [`StageContext::with_worker`](crate::chain::StageContext::with_worker) 访问；
///   [`run_unit`](super::run_unit) 在一个工作单元前后登记/清除事务起始时间并清空线程属性；
/// - **契约 (What)**：类型为 `Send` 但不是 `Sync`，只在宿主线程上访问；事务超时只是簿记，
///   是否中断线程由外部看门狗依据 [`TransactionProbe`] 决定。
pub struct WorkerResources {
    name: Arc<str>,
    arena: ThreadArena,
    cache: ObjectCache,
    attributes: AttributeHolder,
    clock: Arc<dyn Clock>,
    probe: TransactionProbe,
    /// 当前嵌套的工作单元层数；只有最外层进出时触碰事务簿记。
    unit_depth: usize,
    _not_sync: PhantomData<Cell<()>>,
}

impl WorkerResources {
    /// 以系统时钟创建。
    pub fn new(name: impl Into<Arc<str>>, settings: &WorkerSettings) -> Self {
        Self::with_clock(name, settings, Arc::new(SystemClock))
    }

    /// 注入时钟。
    pub fn with_clock(
        name: impl Into<Arc<str>>,
        settings: &WorkerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let name = name.into();
        let probe = TransactionProbe::new(
            Arc::clone(&name),
            clock.now(),
            settings.transaction_timeout(),
        );
        Self {
            name,
            arena: ThreadArena::new(settings.arena_limits()),
            cache: ObjectCache::new(settings.object_cache_max_per_type),
            attributes: AttributeHolder::new(thread_attributes()),
            clock,
            probe,
            unit_depth: 0,
            _not_sync: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arena(&self) -> &ThreadArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut ThreadArena {
        &mut self.arena
    }

    /// 从竞技场取缓冲的快捷方式。
    pub fn take_buffer(&mut self, class: SizeClass) -> bytes::BytesMut {
        self.arena.take(class)
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ObjectCache {
        &mut self.cache
    }

    pub fn take_from_cache<T: Send + 'static>(&mut self, ty: &CachedType<T>) -> Option<T> {
        self.cache.take(ty)
    }

    pub fn put_to_cache<T: Send + 'static>(&mut self, ty: &CachedType<T>, value: T) -> bool {
        self.cache.put(ty, value)
    }

    /// 线程属性，绑定 [`thread_attributes`] 注册表；每个工作单元结束时清空。
    pub fn attributes(&mut self) -> &mut AttributeHolder {
        &mut self.attributes
    }

    /// 记录事务起始时间。
    pub fn begin_transaction(&mut self) {
        self.probe.begin(self.clock.now());
    }

    /// 清除事务起始时间。
    pub fn end_transaction(&mut self) {
        self.probe.end();
    }

    /// 进入一个工作单元；最外层进入时开始事务。
    pub(super) fn enter_unit(&mut self) {
        if self.unit_depth == 0 {
            self.begin_transaction();
        }
        self.unit_depth += 1;
    }

    /// 离开一个工作单元；最外层离开时结束事务并清空线程属性。
    pub(super) fn leave_unit(&mut self) {
        self.unit_depth = self.unit_depth.saturating_sub(1);
        if self.unit_depth == 0 {
            self.end_transaction();
            self.attributes.clear();
        }
    }

    /// 当前嵌套的工作单元层数，`0` 表示不在任何单元内。
    pub fn unit_depth(&self) -> usize {
        self.unit_depth
    }

    pub fn transaction_started(&self) -> Option<Instant> {
        self.probe.started_at()
    }

    pub fn transaction_timeout(&self) -> Option<Duration> {
        self.probe.timeout()
    }

    /// 调整事务超时；`None` 表示不限。
    pub fn set_transaction_timeout(&mut self, timeout: Option<Duration>) {
        self.probe.set_timeout(timeout);
    }

    /// 供看门狗使用的探针。
    pub fn probe(&self) -> TransactionProbe {
        self.probe.clone()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}

impl fmt::Debug for WorkerResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerResources")
            .field("name", &self.name)
            .field("arena", &self.arena)
            .field("cache", &self.cache)
            .field("attributes", &self.attributes)
            .field("probe", &self.probe)
            .field("unit_depth", &self.unit_depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MockClock;

    #[test]
    fn probe_reports_stall_only_past_timeout() {
        let clock = MockClock::new();
        let settings = WorkerSettings {
            transaction_timeout_ms: 100,
            ..WorkerSettings::default()
        };
        let mut worker = WorkerResources::with_clock("w-0", &settings, Arc::new(clock.clone()));
        let probe = worker.probe();
        assert!(probe.started_at().is_none());

        clock.advance(Duration::from_millis(10));
        worker.begin_transaction();
        assert_eq!(worker.transaction_started(), Some(clock.now()));

        clock.advance(Duration::from_millis(100));
        assert!(!probe.is_stalled(clock.now()));
        clock.advance(Duration::from_millis(1));
        assert!(probe.is_stalled(clock.now()));

        worker.end_transaction();
        assert!(!probe.is_stalled(clock.now()));
        assert_eq!(probe.worker_name(), "w-0");
    }

    #[test]
    fn unlimited_timeout_never_stalls() {
        let clock = MockClock::new();
        let mut worker =
            WorkerResources::with_clock("w-1", &WorkerSettings::default(), Arc::new(clock.clone()));
        assert!(worker.transaction_timeout().is_none());
        worker.begin_transaction();
        clock.advance(Duration::from_secs(3600));
        assert!(!worker.probe().is_stalled(clock.now()));

        worker.set_transaction_timeout(Some(Duration::from_secs(1)));
        assert!(worker.probe().is_stalled(clock.now()));
    }
}
