//! `attribute_properties`：以性质测试锁定属性注册表与持有者的核心不变量。
//!
//! # 测试目标（Why）
//! - 槽位一旦分配就被所有持有者当作数组下标使用，任何不稳定都会让不同层的属性互相覆盖；
//! - 工厂默认值可能代价高昂（例如分配缓冲），必须保证每个持有者至多物化一次。
//!
//! # 结构安排（How）
//! - `prop_slots_are_unique_and_stable`：随机名称集合重复声明，槽位唯一且不变；
//! - `prop_factory_runs_once_per_holder`：随机次数的 `get` 只触发一次工厂；
//! - `cleared_holder_rematerializes_default`：`clear` 后重新物化；
//! - `conflicting_type_is_reported`：同名异类型返回错误码；
//! - `concurrent_declare_allocates_one_slot`：多线程同时声明同一新名称，只分配一个槽位。

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use proptest::prelude::*;
use spindle_core::{AttributeHolder, AttributeRegistry, codes};

proptest! {
    #[test]
    fn prop_slots_are_unique_and_stable(
        names in prop::collection::btree_set("[a-z]{1,12}", 1..32)
    ) {
        let registry = AttributeRegistry::new();
        let mut first_pass = HashMap::new();
        for name in &names {
            let attribute = registry.declare::<u64>(name).expect("首次声明");
            first_pass.insert(name.clone(), attribute.index());
        }

        let distinct: BTreeSet<usize> = first_pass.values().copied().collect();
        prop_assert_eq!(distinct.len(), names.len());
        prop_assert_eq!(registry.len(), names.len());

        for name in names.iter().rev() {
            let again = registry.declare::<u64>(name).expect("重复声明返回同一句柄");
            prop_assert_eq!(again.index(), first_pass[name]);
            let resolved = registry.resolve(name).expect("已声明的名称可解析");
            prop_assert_eq!(resolved.index(), first_pass[name]);
        }
    }

    #[test]
    fn prop_factory_runs_once_per_holder(reads in 1usize..64) {
        let registry = AttributeRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let attribute = registry
            .declare_with_factory("scratch", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                vec![0u8; 16]
            })
            .expect("声明");

        let mut holder = AttributeHolder::new(&registry);
        for _ in 0..reads {
            prop_assert_eq!(holder.get(&attribute).map(Vec::len), Some(16));
        }
        prop_assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

/// `clear` 之后再次读取会重新物化一次工厂默认值。
#[test]
fn cleared_holder_rematerializes_default() {
    let registry = AttributeRegistry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let attribute = registry
        .declare_with_factory("session.buffer", move || counter.fetch_add(1, Ordering::SeqCst))
        .expect("声明");

    let mut holder = AttributeHolder::new(&registry);
    assert_eq!(holder.get(&attribute).copied(), Some(0));
    assert_eq!(holder.get(&attribute).copied(), Some(0));
    holder.clear();
    assert!(holder.is_empty());
    assert_eq!(holder.get(&attribute).copied(), Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// 同一名称以不同类型再次声明会被拒绝，原句柄不受影响。
#[test]
fn conflicting_type_is_reported() {
    let registry = AttributeRegistry::new();
    let original = registry.declare::<String>("request.path").expect("声明");
    let error = registry
        .declare::<u32>("request.path")
        .expect_err("类型冲突");
    assert_eq!(error.code(), codes::ATTRIBUTE_TYPE_MISMATCH);

    let mut holder = AttributeHolder::new(&registry);
    holder.set(&original, "/index".to_owned());
    assert_eq!(holder.peek(&original).map(String::as_str), Some("/index"));
}

#[test]
fn concurrent_declare_allocates_one_slot() {
    const CALLERS: usize = 8;
    let registry = Arc::new(AttributeRegistry::new());
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                // 所有线程就位后同时声明，迫使读锁未命中后的写锁路径发生竞争。
                barrier.wait();
                registry
                    .declare::<u64>("race.same_name")
                    .expect("同类型重复声明不报错")
            })
        })
        .collect();
    let attributes: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("声明线程不应 panic"))
        .collect();

    let indices: BTreeSet<usize> = attributes.iter().map(|attribute| attribute.index()).collect();
    assert_eq!(indices.len(), 1, "所有调用方拿到同一个槽位");
    assert_eq!(registry.len(), 1);
    assert!(attributes.iter().all(|attribute| attribute.name() == "race.same_name"));
}
