//! 可注入时钟。
//!
//! - **意图 (Why)**：事务起始时间与停滞判定都依赖“当前时间”；直接调用 `Instant::now` 会让测试无法复现，
//!   因此以 trait 注入，生产用 [`SystemClock`]，测试用 [`MockClock`] 手动推进；
//! - **契约 (What)**：`now` 单调不减；`MockClock` 的克隆共享同一条时间线。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 单调时钟。
pub trait Clock: Send + Sync + 'static {
    /// 当前时间点。
    fn now(&self) -> Instant;
}

/// 委托给 [`Instant::now`] 的系统时钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 手动推进的虚拟时钟。
///
/// ```rust
/// use std::time::Duration;
/// use spindle_core::time::{Clock, MockClock};
///
/// let clock = MockClock::new();
/// let start = clock.now();
/// clock.advance(Duration::from_millis(5));
/// assert_eq!(clock.now() - start, Duration::from_millis(5));
/// ```
#[derive(Clone, Debug)]
pub struct MockClock {
    origin: Instant,
    elapsed_nanos: Arc<AtomicU64>,
}

impl MockClock {
    /// 以当前真实时间为起点。
    pub fn new() -> Self {
        Self::with_origin(Instant::now())
    }

    /// 指定起点。
    pub fn with_origin(origin: Instant) -> Self {
        Self {
            origin,
            elapsed_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 推进虚拟时间。
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_nanos.fetch_add(nanos, Ordering::AcqRel);
    }

    /// 自起点以来的虚拟时长。
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos.load(Ordering::Acquire))
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}
