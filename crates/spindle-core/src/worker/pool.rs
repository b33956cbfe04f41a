use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{info, warn};

use super::{TransactionProbe, WorkerResources, install, run_unit, uninstall};
use crate::configuration::WorkerSettings;
use crate::error::{CoreError, codes};
use crate::time::{Clock, SystemClock};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// 固定规模的工作线程池。
///
/// # 教案级说明
/// - **意图 (Why)**：为每个线程安装 [`WorkerResources`]，使处理链阶段在任意工作线程上都能拿到线程独占资源；
/// - **逻辑 (How)**：任务经 `crossbeam-channel` 队列分发（`queue_capacity = 0` 时无界，否则有界并在满时阻塞提交方）；
///   每个任务包裹在 [`run_unit`] 中执行，任务 panic 被捕获并记录，线程继续服务；
/// - **契约 (What)**：`shutdown` 关闭队列并等待所有线程退出，已入队的任务会先执行完；
///   关闭后 `execute` 返回 `worker.shutdown`。
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    probes: Vec<TransactionProbe>,
}

impl WorkerPool {
    /// 以系统时钟启动。
    pub fn new(settings: &WorkerSettings) -> Result<Self, CoreError> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// 注入时钟启动。
    pub fn with_clock(settings: &WorkerSettings, clock: Arc<dyn Clock>) -> Result<Self, CoreError> {
        let (sender, receiver) = if settings.queue_capacity == 0 {
            crossbeam_channel::unbounded()
        } else {
            crossbeam_channel::bounded(settings.queue_capacity)
        };

        let mut pool = Self {
            sender: Some(sender),
            handles: Vec::with_capacity(settings.threads),
            probes: Vec::with_capacity(settings.threads),
        };
        for index in 0..settings.threads {
            let name = format!("{}-{index}", settings.name_prefix);
            let resources =
                WorkerResources::with_clock(name.as_str(), settings, Arc::clone(&clock));
            pool.probes.push(resources.probe());
            let jobs = receiver.clone();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(resources, jobs))
                .map_err(|err| {
                    CoreError::new(codes::WORKER_SPAWN, format!("failed to spawn worker `{name}`"))
                        .with_cause(err)
                })?;
            pool.handles.push(handle);
        }
        Ok(pool)
    }

    /// 投递任务。
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<(), CoreError> {
        let sender = self.sender.as_ref().ok_or_else(shutdown_error)?;
        sender.send(Box::new(job)).map_err(|_| shutdown_error())
    }

    /// 各线程的事务探针，顺序与线程序号一致。
    pub fn probes(&self) -> &[TransactionProbe] {
        &self.probes
    }

    /// 线程数量。
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// 关闭队列并等待全部线程退出。
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker.join_failed");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.handles.len())
            .field("accepting", &self.sender.is_some())
            .finish()
    }
}

fn shutdown_error() -> CoreError {
    CoreError::new(codes::WORKER_SHUTDOWN, "worker pool is shut down")
}

fn worker_loop(resources: WorkerResources, jobs: Receiver<Job>) {
    let name = resources.name().to_owned();
    install(resources);
    info!(worker = %name, "worker.started");
    for job in jobs.iter() {
        run_unit(|| {
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                warn!(worker = %name, "worker.job_panicked");
            }
        });
    }
    uninstall();
    info!(worker = %name, "worker.stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::with_current;
    use std::sync::mpsc;

    #[test]
    fn jobs_run_with_resources_installed() {
        let settings = WorkerSettings {
            threads: 2,
            name_prefix: "pool-test".to_owned(),
            ..WorkerSettings::default()
        };
        let pool = WorkerPool::new(&settings).expect("启动线程池");
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.probes()[1].worker_name(), "pool-test-1");

        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            pool.execute(move || {
                let seen = with_current(|worker| {
                    (worker.name().to_owned(), worker.transaction_started().is_some())
                });
                tx.send(seen).expect("主线程存活");
            })
            .expect("投递");
        }
        drop(tx);
        let results: Vec<_> = rx.iter().collect();
        assert_eq!(results.len(), 4);
        for seen in results {
            let (name, in_transaction) = seen.expect("资源已安装");
            assert!(name.starts_with("pool-test-"));
            assert!(in_transaction);
        }
        pool.shutdown();
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let settings = WorkerSettings {
            threads: 1,
            ..WorkerSettings::default()
        };
        let pool = WorkerPool::new(&settings).expect("启动线程池");
        pool.execute(|| panic!("job failure")).expect("投递");
        let (tx, rx) = std::sync::mpsc::channel();
        pool.execute(move || tx.send(()).expect("主线程存活")).expect("投递");
        rx.recv().expect("线程仍在服务");
    }
}
