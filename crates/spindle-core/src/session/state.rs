use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// 会话状态：`New → Connected → Closing → Closed` 的线性格，外加 `Connected → Closed`
/// 与 `New → Closed` 两条异常终止捷径。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum SessionState {
    New = 0,
    Connected = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    /// `Connected` 与 `Closing` 均视为已连接：关闭中的会话仍可冲刷控制帧。
    pub const fn is_connected(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Closing)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// 状态格允许的跃迁；不存在回边。
    pub const fn can_transition_to(self, target: SessionState) -> bool {
        matches!(
            (self, target),
            (SessionState::New, SessionState::Connected)
                | (SessionState::New, SessionState::Closed)
                | (SessionState::Connected, SessionState::Closing)
                | (SessionState::Connected, SessionState::Closed)
                | (SessionState::Closing, SessionState::Closed)
        )
    }

    const fn from_raw(raw: u8) -> SessionState {
        match raw {
            0 => SessionState::New,
            1 => SessionState::Connected,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::New => "new",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        })
    }
}

/// `AtomicU8` 承载的状态单元，每条边都是一次比较交换。
pub(super) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(super) const fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(super) fn load(&self) -> SessionState {
        SessionState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// 仅当当前状态为 `from` 时切换到 `to`；失败时返回观察到的实际状态。
    pub(super) fn transition(
        &self,
        from: SessionState,
        to: SessionState,
    ) -> Result<(), SessionState> {
        debug_assert!(from.can_transition_to(to), "illegal edge {from} -> {to}");
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SessionState::from_raw)
    }

    /// 无条件进入 `Closed`，返回之前的状态。
    pub(super) fn force_closed(&self) -> SessionState {
        SessionState::from_raw(self.0.swap(SessionState::Closed as u8, Ordering::AcqRel))
    }
}
