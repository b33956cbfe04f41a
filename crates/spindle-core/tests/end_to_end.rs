//! `end_to_end`：读取器 → 连接驱动 → 处理链 → 会话的完整路径。
//!
//! # 测试目标（Why）
//! - 各组件单测只覆盖自身契约，组合后才能验证“完整消息恰好进入处理链一次”“关闭帧终止本轮”等跨组件行为；
//! - `Rerun` 的计数语义（阶段被重复调用、后续阶段只跑一次）只有在完整链上才有意义。
//!
//! # 结构安排（How）
//! - `rerun_twice_then_invoke`：三阶段链，第二阶段前两次返回 `Rerun`；
//! - `reader_feeds_session_through_chain`：按行切分的读取器驱动解码阶段与会话分派阶段；
//! - `worker_pool_runs_chain_with_resources`：在线程池中执行，阶段可见线程资源与事务簿记。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use bytes::Bytes;
use spindle_core::chain::stage_fn;
use spindle_core::configuration::WorkerSettings;
use spindle_core::reader::Terminator;
use spindle_core::session::{CloseFrame, Frame, SessionDispatchStage};
use spindle_core::{
    AttributeHolder, ChainBuilder, ChainEvent, ChainOutcome, ConnectionDriver, CoreError,
    Directive, DriverCompletion, EventKind, IncrementalReader, ProtocolHandler, Session,
    SessionListener, SessionState, WorkerPool,
};
use spindle_transport::{ConnectionId, Intercept, Interceptor, ReadEvent};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// 按 `RUST_LOG` 输出处理链日志，便于定位失败用例；重复安装时静默忽略。
fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

#[test]
fn rerun_twice_then_invoke() {
    init_tracing();
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let third = Arc::new(AtomicUsize::new(0));

    let (a, b, c) = (Arc::clone(&first), Arc::clone(&second), Arc::clone(&third));
    let pool = ChainBuilder::new("rerun")
        .stage(stage_fn("first", move |_| {
            a.fetch_add(1, Ordering::SeqCst);
            Ok(Directive::Invoke)
        }))
        .stage(stage_fn("second", move |_| {
            let calls = b.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(if calls < 3 { Directive::Rerun } else { Directive::Invoke })
        }))
        .stage(stage_fn("third", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Directive::Invoke)
        }))
        .build()
        .expect("非空链")
        .pool();

    let mut connection = AttributeHolder::detached();
    let outcome = pool
        .acquire()
        .execute(ChainEvent::new(EventKind::Read), &mut connection)
        .expect("整轮成功");
    assert!(matches!(outcome, ChainOutcome::Completed));
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 3);
    assert_eq!(third.load(Ordering::SeqCst), 1);
}

#[derive(Default)]
struct WireLog {
    handshakes: Mutex<Vec<(u16, String)>>,
}

impl ProtocolHandler for WireLog {
    fn send(&self, _frame: Frame) -> Result<(), CoreError> {
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) -> Result<(), CoreError> {
        self.handshakes
            .lock()
            .expect("锁未中毒")
            .push((code, reason.to_owned()));
        Ok(())
    }

    fn teardown(&self) {}
}

#[derive(Default)]
struct Inbox {
    texts: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

impl SessionListener for Inbox {
    fn on_message(&self, _session: &Session, frame: &Frame) {
        let text = frame.as_text().unwrap_or_default().to_owned();
        self.texts.lock().expect("锁未中毒").push(text);
    }

    fn on_close(&self, _session: &Session, _close: &CloseFrame) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn reader_feeds_session_through_chain() {
    init_tracing();
    let dispatch = SessionDispatchStage::new().expect("声明会话属性");
    let frame_slot = dispatch.frame_attribute().clone();
    let session_slot = dispatch.session_attribute().clone();

    let definition = ChainBuilder::new("line-session")
        .stage(stage_fn("decode-line", move |ctx| {
            let Some(payload) = ctx.take_payload() else {
                return Ok(Directive::Invoke);
            };
            let raw = payload.to_bytes();
            let line = String::from_utf8_lossy(&raw).trim_end().to_owned();
            let frame = if line == "bye" {
                Frame::close(&CloseFrame::new(1000, "bye"))
            } else {
                Frame::text(line)
            };
            ctx.invocation().set(&frame_slot, frame);
            Ok(Directive::Invoke)
        }))
        .stage(dispatch)
        .build()
        .expect("非空链");

    let wire = Arc::new(WireLog::default());
    let session = Arc::new(Session::new(wire.clone()));
    let inbox = Arc::new(Inbox::default());
    session.add_listener(inbox.clone());
    session.on_connect().expect("连接");

    let connection = ConnectionId::new(42);
    let driver = Arc::new(spin::Mutex::new(ConnectionDriver::new(connection, definition.pool())));
    driver
        .lock()
        .attributes_mut()
        .set(&session_slot, Arc::clone(&session));

    let mut reader = IncrementalReader::new(
        connection,
        Terminator::new(&b"\n"[..]),
        DriverCompletion::new(Arc::clone(&driver)),
    );
    let chunks: [&'static [u8]; 4] = [b"hel", b"lo\nwor", b"ld\n", b"bye\n"];
    let flags: Vec<Intercept> = chunks
        .into_iter()
        .map(|chunk| reader.intercept(ReadEvent::Fragment(Bytes::from_static(chunk))))
        .collect();
    assert_eq!(
        flags,
        [
            Intercept::INCOMPLETE | Intercept::RESET,
            Intercept::COMPLETED,
            Intercept::COMPLETED,
            Intercept::COMPLETED,
        ]
    );

    // 判定以整段累积为单位：`lo\nwor` 到达时缓冲已含换行，残余的 `wor` 随首条消息一并移交。
    assert_eq!(*inbox.texts.lock().expect("锁未中毒"), ["hello\nwor", "ld"]);
    assert_eq!(inbox.closes.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), SessionState::Closing);
    assert_eq!(
        *wire.handshakes.lock().expect("锁未中毒"),
        [(1000, "bye".to_owned())]
    );
    assert_eq!(reader.completion_mut().take_failures().len(), 0);
    let stats = driver.lock().pool().stats();
    assert_eq!(stats.created, 1, "三条消息复用同一个执行实例");
    assert_eq!(stats.reused, 2);
}

#[test]
fn worker_pool_runs_chain_with_resources() {
    let settings = WorkerSettings {
        threads: 2,
        name_prefix: "e2e".to_owned(),
        ..WorkerSettings::default()
    };
    let workers = WorkerPool::new(&settings).expect("启动线程池");
    let pool = ChainBuilder::new("worker-aware")
        .stage(stage_fn("inspect-worker", |ctx| {
            let seen = ctx.with_worker(|worker| {
                let buffer = worker.arena_mut().take_for(512);
                let in_transaction = worker.transaction_started().is_some();
                worker.arena_mut().release(buffer);
                (worker.name().to_owned(), in_transaction)
            });
            let Some((name, in_transaction)) = seen else {
                return Err(CoreError::new(
                    spindle_core::codes::WORKER_SHUTDOWN,
                    "stage ran outside a worker thread",
                ));
            };
            assert!(name.starts_with("e2e-"));
            assert!(in_transaction);
            Ok(Directive::Invoke)
        }))
        .build()
        .expect("非空链")
        .pool();

    let (tx, rx) = mpsc::channel();
    for id in 0..4u64 {
        let pool = pool.clone();
        let tx = tx.clone();
        workers
            .execute(move || {
                let mut driver = ConnectionDriver::new(ConnectionId::new(id), pool);
                let result = driver.handle_message(Bytes::from_static(b"payload").into());
                tx.send(result.map_err(|error| error.code())).expect("主线程存活");
            })
            .expect("投递");
    }
    drop(tx);
    let results: Vec<_> = rx.iter().collect();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|result| *result == Ok(Directive::Invoke)));
    assert!(pool.stats().created <= 2, "每个工作线程同一时刻至多占用一个实例");
    workers.shutdown();
}
