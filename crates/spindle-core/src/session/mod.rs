//! 消息会话生命周期。
//!
//! # 教案级导览
//!
//! ## 意图（Why）
//! - 会话状态在传输线程（入站回调）与应用线程（`close`/`send`）之间共享，
//!   需要一个不加锁、每条边都显式的状态格；
//! - 监听者集合需支持并发增删与“恰好一次”的关闭通知。
//!
//! ## 结构（How）
//! - [`SessionState`] 存放在 `AtomicU8` 中，每条边都是一次比较交换；
//! - 监听者存放于 `DashMap<ListenerId, Arc<dyn SessionListener>>`，回调前先拍快照，
//!   避免在分片锁内调用外部代码；关闭时逐键 `remove`，只有移除成功的一方负责通知；
//! - 线格式与握手细节委托给 [`ProtocolHandler`]。
//!
//! ## 契约（What）
//! - `close` 仅在 `Connected` 时生效（CAS 到 `Closing` 并发起握手），其余状态为显式 no-op；
//! - `send_*` 只在 `Connected | Closing` 下允许，否则返回 `session.not_connected`；
//! - `broadcast` 要求状态恰为 `Connected`，否则返回 `session.closed`。

mod frame;
mod stage;
mod state;

pub use frame::{ABNORMAL_CLOSURE, CloseFrame, Frame, FrameKind, NORMAL_CLOSURE};
pub use stage::SessionDispatchStage;
pub use state::SessionState;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::error::{CoreError, codes};
use state::AtomicState;

/// 协议层能力：负责把帧写到线上、发起关闭握手与执行本地拆除。
pub trait ProtocolHandler: Send + Sync + 'static {
    /// 编码并发送一帧。
    fn send(&self, frame: Frame) -> Result<(), CoreError>;

    /// 流式发送消息分片；首片的帧类型由实现方自行跟踪。
    fn stream(&self, last: bool, payload: Bytes) -> Result<(), CoreError> {
        self.send(Frame::continuation(payload, last))
    }

    /// 发送关闭帧（主动关闭或回显对端的关闭）。
    fn close(&self, code: u16, reason: &str) -> Result<(), CoreError>;

    /// 本地拆除：释放连接资源，不再与对端交互。
    fn teardown(&self);
}

/// 会话事件监听者，所有回调默认为空实现。
pub trait SessionListener: Send + Sync + 'static {
    fn on_connect(&self, _session: &Session) {}

    /// 完整的文本或二进制消息。
    fn on_message(&self, _session: &Session, _frame: &Frame) {}

    /// 消息分片；`frame.is_final()` 标识最后一片。
    fn on_fragment(&self, _session: &Session, _frame: &Frame) {}

    fn on_ping(&self, _session: &Session, _payload: &Bytes) {}

    fn on_pong(&self, _session: &Session, _payload: &Bytes) {}

    /// 关闭通知，每个监听者至多收到一次，通知后即被移除。
    fn on_close(&self, _session: &Session, _close: &CloseFrame) {}
}

/// 监听者句柄。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ListenerId(u64);

/// `close` 的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseOutcome {
    /// 本次调用赢得 `Connected → Closing`，已发出关闭握手。
    HandshakeSent,
    /// 会话不处于 `Connected`，未做任何事；携带观察到的状态。
    NoOp(SessionState),
}

/// 会话层错误。
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    #[error("session is not connected (state: {state})")]
    NotConnected { state: SessionState },
    #[error("session is already closed (state: {state})")]
    AlreadyClosed { state: SessionState },
}

impl From<SessionError> for CoreError {
    fn from(error: SessionError) -> Self {
        let code = match error {
            SessionError::NotConnected { .. } => codes::SESSION_NOT_CONNECTED,
            SessionError::AlreadyClosed { .. } => codes::SESSION_CLOSED,
        };
        CoreError::new(code, error.to_string())
    }
}

/// 一个消息会话。
pub struct Session {
    state: AtomicState,
    handler: Arc<dyn ProtocolHandler>,
    listeners: DashMap<ListenerId, Arc<dyn SessionListener>>,
    next_listener: AtomicU64,
}

impl Session {
    pub fn new(handler: Arc<dyn ProtocolHandler>) -> Self {
        Self {
            state: AtomicState::new(SessionState::New),
            handler,
            listeners: DashMap::new(),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(id, listener);
        id
    }

    /// 移除监听者；已被关闭流程取走时返回 `false`。
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    /// `Connected` 或 `Closing`。
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// 握手完成：`New → Connected` 并通知监听者。
    ///
    /// 重复调用为 no-op；会话已进入关闭流程时返回 `AlreadyClosed`。
    pub fn on_connect(&self) -> Result<(), SessionError> {
        match self.state.transition(SessionState::New, SessionState::Connected) {
            Ok(()) => {
                debug!("session.connected");
                for listener in self.snapshot() {
                    listener.on_connect(self);
                }
                Ok(())
            }
            Err(SessionState::Connected) => Ok(()),
            Err(state) => Err(SessionError::AlreadyClosed { state }),
        }
    }

    /// 收到完整消息。
    pub fn on_message(&self, frame: &Frame) {
        for listener in self.snapshot() {
            listener.on_message(self, frame);
        }
    }

    /// 收到消息分片。
    pub fn on_fragment(&self, frame: &Frame) {
        for listener in self.snapshot() {
            listener.on_fragment(self, frame);
        }
    }

    /// 收到 ping：先以相同负载回 pong，再通知监听者。
    pub fn on_ping(&self, payload: Bytes) -> Result<(), CoreError> {
        self.send_pong(payload.clone())?;
        for listener in self.snapshot() {
            listener.on_ping(self, &payload);
        }
        Ok(())
    }

    pub fn on_pong(&self, payload: &Bytes) {
        for listener in self.snapshot() {
            listener.on_pong(self, payload);
        }
    }

    /// 收到对端关闭帧。
    ///
    /// - `Connected` 时 CAS 到 `Closing` 并回显关闭帧；
    /// - 其余状态直接进入 `Closed` 并执行本地拆除；
    /// - 两条分支之后都会逐一通知并移除监听者。回显失败的错误在通知完成后返回。
    pub fn on_close(&self, close: CloseFrame) -> Result<(), CoreError> {
        let echoed = match self.state.transition(SessionState::Connected, SessionState::Closing) {
            Ok(()) => {
                debug!(code = close.code, "session.close_echo");
                self.handler.close(close.code, &close.reason)
            }
            Err(_) => {
                self.finish();
                Ok(())
            }
        };
        self.drain_listeners(&close);
        echoed
    }

    /// 主动关闭。仅 `Connected` 时发起握手，其余状态为显式 no-op。
    pub fn close(&self, code: u16, reason: &str) -> Result<CloseOutcome, CoreError> {
        match self.state.transition(SessionState::Connected, SessionState::Closing) {
            Ok(()) => {
                debug!(code, "session.closing");
                self.handler.close(code, reason)?;
                Ok(CloseOutcome::HandshakeSent)
            }
            Err(state) => {
                trace!(%state, "session.close_ignored");
                Ok(CloseOutcome::NoOp(state))
            }
        }
    }

    /// 以正常关闭码关闭。
    pub fn close_normal(&self) -> Result<CloseOutcome, CoreError> {
        self.close(NORMAL_CLOSURE, "")
    }

    /// 底层连接已断开：强制进入 `Closed`，拆除并以 1006 通知尚未收到关闭的监听者。
    pub fn mark_closed(&self) {
        self.finish();
        self.drain_listeners(&CloseFrame::new(ABNORMAL_CLOSURE, ""));
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), CoreError> {
        self.send_frame(Frame::text(text))
    }

    pub fn send_binary(&self, payload: impl Into<Bytes>) -> Result<(), CoreError> {
        self.send_frame(Frame::binary(payload))
    }

    /// 流式发送一个分片。
    pub fn send_fragment(&self, last: bool, payload: impl Into<Bytes>) -> Result<(), CoreError> {
        self.ensure_connected()?;
        self.handler.stream(last, payload.into())
    }

    pub fn send_ping(&self, payload: impl Into<Bytes>) -> Result<(), CoreError> {
        self.send_frame(Frame::ping(payload))
    }

    pub fn send_pong(&self, payload: impl Into<Bytes>) -> Result<(), CoreError> {
        self.send_frame(Frame::pong(payload))
    }

    /// 发送任意帧。
    pub fn send_frame(&self, frame: Frame) -> Result<(), CoreError> {
        self.ensure_connected()?;
        self.handler.send(frame)
    }

    /// 把同一帧发给多个会话，返回成功投递的数量。
    ///
    /// 发起方必须恰处于 `Connected`；单个接收方发送失败只记录告警，不中断其余投递。
    pub fn broadcast<'a, I>(&self, recipients: I, frame: &Frame) -> Result<usize, CoreError>
    where
        I: IntoIterator<Item = &'a Session>,
    {
        let state = self.state();
        if state != SessionState::Connected {
            return Err(SessionError::AlreadyClosed { state }.into());
        }
        let mut delivered = 0;
        for recipient in recipients {
            match recipient.send_frame(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(error) => warn!(%error, "session.broadcast_skipped"),
            }
        }
        Ok(delivered)
    }

    fn ensure_connected(&self) -> Result<(), SessionError> {
        let state = self.state();
        if state.is_connected() {
            Ok(())
        } else {
            Err(SessionError::NotConnected { state })
        }
    }

    /// 进入 `Closed`；只有第一次进入的调用执行拆除。
    fn finish(&self) {
        let previous = self.state.force_closed();
        if !previous.is_terminal() {
            debug!(%previous, "session.closed");
            self.handler.teardown();
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn SessionListener>> {
        let mut listeners: Vec<_> = self
            .listeners
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        listeners.sort_unstable_by_key(|(id, _)| *id);
        listeners.into_iter().map(|(_, listener)| listener).collect()
    }

    fn drain_listeners(&self, close: &CloseFrame) {
        let mut ids: Vec<ListenerId> = self.listeners.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        for id in ids {
            if let Some((_, listener)) = self.listeners.remove(&id) {
                listener.on_close(self, close);
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
