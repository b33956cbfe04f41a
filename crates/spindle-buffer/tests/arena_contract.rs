//! `arena_contract` 集成测试：从公开 API 视角验证 `ThreadArena` 的复用、上限与统计契约。
//!
//! # 测试目标（Why）
//! - 工作线程依赖竞技场避免每请求分配临时缓冲，一旦复用路径失效只会表现为性能回退，难以在线上察觉；
//! - 每级上限是防止线程本地内存无界增长的唯一手段，必须以测试锁定。
//!
//! # 结构安排（How）
//! - `released_buffer_is_reused_empty`：归还后再次取出同一级别，应命中自由链表且内容已清空；
//! - `class_bound_discards_overflow`：超过 `max_buffers_per_class` 的归还被丢弃；
//! - `shrink_reports_reclaimed_capacity`：收缩后统计归零；
//! - `prop_take_respects_requested_capacity`：随机请求下后置条件恒成立。

use bytes::BufMut;
use proptest::prelude::*;
use spindle_buffer::{ArenaLimits, SizeClass, ThreadArena};

fn small_arena(per_class: usize) -> ThreadArena {
    ThreadArena::new(ArenaLimits {
        min_class_bytes: 64,
        max_class_bytes: 1024,
        max_buffers_per_class: per_class,
    })
}

/// 归还后的缓冲在下一次同级别 `take` 中被复用，且长度已被重置为 0。
#[test]
fn released_buffer_is_reused_empty() {
    let mut arena = small_arena(4);
    let mut buffer = arena.take(SizeClass::for_capacity(200));
    buffer.put_slice(b"scratch data");
    let capacity = buffer.capacity();
    assert!(arena.release(buffer));

    let again = arena.take(SizeClass::for_capacity(200));
    assert!(again.is_empty(), "复用的缓冲不得携带上一次的内容");
    assert!(again.capacity() >= capacity.min(256));

    let stats = arena.stats();
    assert_eq!(stats.fresh_allocations, 1);
    assert_eq!(stats.reuses, 1);
    assert_eq!(stats.released, 1);
    assert_eq!(stats.cached_buffers, 0);
}

/// 每级上限之外的归还被丢弃，统计如实记录。
#[test]
fn class_bound_discards_overflow() {
    let mut arena = small_arena(2);
    let buffers: Vec<_> = (0..3).map(|_| arena.take_for(128)).collect();
    let accepted: Vec<bool> = buffers.into_iter().map(|b| arena.release(b)).collect();
    assert_eq!(accepted, vec![true, true, false]);

    let stats = arena.stats();
    assert_eq!(stats.cached_buffers, 2);
    assert_eq!(stats.discarded, 1);
    assert!(stats.cached_bytes >= 256);
}

/// `shrink` 释放全部缓存并返回回收的容量。
#[test]
fn shrink_reports_reclaimed_capacity() {
    let mut arena = small_arena(8);
    for _ in 0..3 {
        let buffer = arena.take_for(64);
        arena.release(buffer);
    }
    let before = arena.stats().cached_bytes;
    assert!(before > 0);
    assert_eq!(arena.shrink(), before);
    assert_eq!(arena.stats().cached_buffers, 0);
    assert_eq!(arena.stats().cached_bytes, 0);
}

/// 超出池化区间的外部缓冲不会进入自由链表。
#[test]
fn foreign_small_buffer_is_discarded() {
    let mut arena = small_arena(8);
    assert!(!arena.release(bytes::BytesMut::with_capacity(8)));
    assert_eq!(arena.stats().discarded, 1);
}

proptest! {
    /// 无论请求与归还顺序如何，`take_for(n)` 总是返回容量不小于 `n` 的空缓冲，
    /// 且缓存数量不超过 级别数 × 每级上限。
    #[test]
    fn prop_take_respects_requested_capacity(
        requests in proptest::collection::vec((1usize..4096, any::<bool>()), 1..64)
    ) {
        let mut arena = small_arena(3);
        for (size, give_back) in requests {
            let buffer = arena.take_for(size);
            prop_assert!(buffer.is_empty());
            prop_assert!(buffer.capacity() >= size);
            if give_back {
                arena.release(buffer);
            }
        }
        // 64..=1024 共 5 个级别。
        prop_assert!(arena.stats().cached_buffers <= 5 * 3);
    }
}
