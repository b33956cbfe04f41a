//! 工作线程资源模型。
//!
//! # 教案级导览
//!
//! ## 意图（Why）
//! - 处理链的阶段在工作线程上同步执行，热路径上的临时缓冲、草稿对象都应来自线程独占的资源，
//!   而非每请求分配；
//! - 外部看门狗需要知道“哪个线程从什么时候开始处理当前单元”，以便识别停滞线程。
//!
//! ## 结构（How）
//! - [`WorkerResources`]：竞技场 + 对象缓存 + 线程属性 + 事务簿记，只属于一个线程；
//! - 线程本地槽位：[`install`]/[`uninstall`]/[`with_current`] 管理当前线程的资源，
//!   [`run_unit`] 包裹一个工作单元；
//! - [`WorkerPool`]：固定数量的命名线程，各自安装资源并从 `crossbeam-channel` 队列取任务；
//!   任务投递本身提供了跨线程的 happens-before 边。
//!
//! ## 契约（What）
//! - `with_current` 不可重入：嵌套调用返回 `None` 而不是 panic；
//! - `run_unit` 可以嵌套：只有最外层单元开始/结束事务并清空线程属性，内层单元对外层透明；
//! - 即使闭包 panic，最外层 `run_unit` 也会结束事务并清空线程属性。

mod cache;
mod pool;
mod resources;

pub use cache::{CachedType, ObjectCache};
pub use pool::WorkerPool;
pub use resources::{TransactionProbe, WorkerResources, thread_attributes};

use std::cell::RefCell;

thread_local! {
    static CURRENT: RefCell<Option<WorkerResources>> = const { RefCell::new(None) };
}

/// 为当前线程安装资源，返回此前安装的资源。
pub fn install(resources: WorkerResources) -> Option<WorkerResources> {
    CURRENT.with(|slot| slot.borrow_mut().replace(resources))
}

/// 卸下当前线程的资源。
pub fn uninstall() -> Option<WorkerResources> {
    CURRENT.with(|slot| slot.borrow_mut().take())
}

/// 当前线程是否安装了资源。
pub fn is_installed() -> bool {
    CURRENT.with(|slot| slot.try_borrow().map(|current| current.is_some()).unwrap_or(true))
}

/// 以可变引用访问当前线程的资源；未安装或已被外层借用时返回 `None`。
pub fn with_current<R>(f: impl FnOnce(&mut WorkerResources) -> R) -> Option<R> {
    CURRENT.with(|slot| {
        let mut current = slot.try_borrow_mut().ok()?;
        current.as_mut().map(f)
    })
}

/// 运行一个工作单元：开始前登记事务起始时间，结束后清除并清空线程属性。
///
/// 嵌套调用（例如线程池任务内部再经由连接驱动分派）只增加层数，事务簿记与线程属性
/// 由最外层单元负责。未安装资源时直接执行闭包。
pub fn run_unit<R>(f: impl FnOnce() -> R) -> R {
    struct UnitGuard {
        entered: bool,
    }

    impl Drop for UnitGuard {
        fn drop(&mut self) {
            if self.entered {
                with_current(WorkerResources::leave_unit);
            }
        }
    }

    let _guard = UnitGuard {
        entered: with_current(WorkerResources::enter_unit).is_some(),
    };
    f()
}
