use std::cell::Cell;
use std::marker::PhantomData;

use bytes::BytesMut;
use tracing::trace;

/// 二次幂尺寸级别，内部以位移量表示（`bytes() == 1 << shift`）。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SizeClass(u8);

impl SizeClass {
    /// 能容纳 `capacity` 字节的最小级别（向上取整到二次幂）。
    pub fn for_capacity(capacity: usize) -> SizeClass {
        let rounded = capacity
            .max(1)
            .checked_next_power_of_two()
            .unwrap_or(1 << (usize::BITS - 1));
        SizeClass(rounded.trailing_zeros() as u8)
    }

    /// 不超过 `capacity` 的最大级别（向下取整到二次幂）。
    fn floor_of(capacity: usize) -> Option<SizeClass> {
        if capacity == 0 {
            return None;
        }
        Some(SizeClass((usize::BITS - 1 - capacity.leading_zeros()) as u8))
    }

    /// 最大可表示的级别，`bytes()` 为 `usize` 的最高位。
    pub const MAX: SizeClass = SizeClass((usize::BITS - 1) as u8);

    /// 由位移量直接构造；超出 `usize` 位宽的位移量被钳制到 [`SizeClass::MAX`]。
    pub const fn from_shift(shift: u8) -> SizeClass {
        if shift > Self::MAX.0 {
            Self::MAX
        } else {
            SizeClass(shift)
        }
    }

    /// 位移量。
    pub const fn shift(self) -> u8 {
        self.0
    }

    /// 级别对应的字节数。
    pub const fn bytes(self) -> usize {
        1usize << self.0
    }
}

/// 竞技场的容量边界，均为配置旋钮而非架构常量。
///
/// - `min_class_bytes`：最小池化级别，更小的请求向上取整到该级别；
/// - `max_class_bytes`：最大池化级别，更大的请求直接分配且归还时丢弃；
/// - `max_buffers_per_class`：每级自由链表的上限，超出后归还的缓冲被丢弃，避免线程本地内存无界增长。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArenaLimits {
    pub min_class_bytes: usize,
    pub max_class_bytes: usize,
    pub max_buffers_per_class: usize,
}

impl Default for ArenaLimits {
    fn default() -> Self {
        Self {
            min_class_bytes: 64,
            max_class_bytes: 64 * 1024,
            max_buffers_per_class: 16,
        }
    }
}

/// 竞技场统计快照。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ArenaStats {
    /// 自由链表未命中、在堆上新分配的次数。
    pub fresh_allocations: u64,
    /// 自由链表命中次数。
    pub reuses: u64,
    /// 成功放回自由链表的次数。
    pub released: u64,
    /// 归还时因超出边界而丢弃的次数。
    pub discarded: u64,
    /// 当前缓存的缓冲数量。
    pub cached_buffers: usize,
    /// 当前缓存的总容量。
    pub cached_bytes: usize,
}

/// 线程独占的内存竞技场。
///
/// # 模块角色（Why）
/// - 每个工作线程持有一个实例，处理链中的 Stage 借此获得临时缓冲而无需每请求分配；
/// - 与共享缓冲池不同，这里没有任何锁或原子操作：所有权模型保证只有宿主线程能访问。
///
/// # 核心机制（How）
/// - 以 [`SizeClass`] 为键维护若干 `Vec<BytesMut>` 自由链表，`take` 优先弹出、未命中则新分配；
/// - `release` 按缓冲容量向下取整定位级别，保证之后从该级别取出的缓冲至少满足级别大小；
/// - 每级长度受 `max_buffers_per_class` 约束，超出即丢弃。
///
/// # 契约说明（What）
/// - **线程安全**：类型为 `Send` 但不是 `Sync`；
/// - **后置条件**：`take(class)` 返回的缓冲 `len() == 0` 且 `capacity() >= class.bytes()`；
/// - **异常处理**：所有操作都不会失败，资源紧张时退化为直接分配。
pub struct ThreadArena {
    limits: ArenaLimits,
    min_shift: u8,
    max_shift: u8,
    classes: Vec<Vec<BytesMut>>,
    stats: ArenaStats,
    _not_sync: PhantomData<Cell<()>>,
}

impl ThreadArena {
    /// 以给定边界创建竞技场；边界会被规整为二次幂。
    pub fn new(limits: ArenaLimits) -> Self {
        let min_shift = SizeClass::for_capacity(limits.min_class_bytes).shift();
        let max_class_bytes = limits.max_class_bytes.max(limits.min_class_bytes);
        let max_shift = SizeClass::for_capacity(max_class_bytes).shift();
        let class_count = usize::from(max_shift - min_shift) + 1;
        Self {
            limits,
            min_shift,
            max_shift,
            classes: (0..class_count).map(|_| Vec::new()).collect(),
            stats: ArenaStats::default(),
            _not_sync: PhantomData,
        }
    }

    /// 当前边界。
    pub fn limits(&self) -> ArenaLimits {
        self.limits
    }

    /// 取出一个至少为 `class` 大小的空缓冲。
    pub fn take(&mut self, class: SizeClass) -> BytesMut {
        let shift = class.shift().max(self.min_shift);
        if shift > self.max_shift {
            self.stats.fresh_allocations += 1;
            trace!(class_bytes = class.bytes(), "arena.take.unpooled");
            return BytesMut::with_capacity(class.bytes());
        }
        let slot = usize::from(shift - self.min_shift);
        match self.classes[slot].pop() {
            Some(mut buffer) => {
                buffer.clear();
                self.stats.reuses += 1;
                buffer
            }
            None => {
                self.stats.fresh_allocations += 1;
                BytesMut::with_capacity(SizeClass::from_shift(shift).bytes())
            }
        }
    }

    /// 按最小容量取缓冲。
    pub fn take_for(&mut self, min_capacity: usize) -> BytesMut {
        self.take(SizeClass::for_capacity(min_capacity))
    }

    /// 归还缓冲；返回 `false` 表示缓冲被丢弃。
    pub fn release(&mut self, mut buffer: BytesMut) -> bool {
        let Some(class) = SizeClass::floor_of(buffer.capacity()) else {
            self.stats.discarded += 1;
            return false;
        };
        if class.shift() < self.min_shift || class.shift() > self.max_shift {
            self.stats.discarded += 1;
            return false;
        }
        let slot = usize::from(class.shift() - self.min_shift);
        let list = &mut self.classes[slot];
        if list.len() >= self.limits.max_buffers_per_class {
            self.stats.discarded += 1;
            return false;
        }
        buffer.clear();
        list.push(buffer);
        self.stats.released += 1;
        true
    }

    /// 清空全部自由链表，返回释放的总容量。
    pub fn shrink(&mut self) -> usize {
        let mut reclaimed = 0;
        for list in &mut self.classes {
            reclaimed += list.iter().map(BytesMut::capacity).sum::<usize>();
            list.clear();
        }
        reclaimed
    }

    /// 统计快照。
    pub fn stats(&self) -> ArenaStats {
        let mut snapshot = self.stats;
        snapshot.cached_buffers = self.classes.iter().map(Vec::len).sum();
        snapshot.cached_bytes = self
            .classes
            .iter()
            .flat_map(|list| list.iter().map(BytesMut::capacity))
            .sum();
        snapshot
    }
}

impl Default for ThreadArena {
    fn default() -> Self {
        Self::new(ArenaLimits::default())
    }
}

impl std::fmt::Debug for ThreadArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadArena")
            .field("limits", &self.limits)
            .field("stats", &self.stats())
            .finish()
    }
}
