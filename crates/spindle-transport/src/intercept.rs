use bytes::Bytes;
use core::fmt;
use core::ops::{BitOr, BitOrAssign};

use crate::TransportError;

/// 拦截器回调的返回标志位。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 传输层每投递一个原始分片就调用一次拦截器，拦截器需要告诉传输层：本单元是否已经完整、
///   是否需要再为一个分片重新布防；
/// - 标志位可组合（例如 `INCOMPLETE | RESET`），与传输实现的既有约定保持一致。
///
/// ## 契约说明（What）
/// - `DEFAULT`：拦截器对本事件无意见，由传输层按默认策略处理；
/// - `COMPLETED`：当前逻辑单元已结束，传输层停止向该拦截器投递；
/// - `INCOMPLETE`：数据不足，单元尚未结束；
/// - `RESET`：请求传输层重置本次读结果并为下一个分片重新布防。
///
/// ## 风险提示（Trade-offs）
/// - 核心只会产生 `COMPLETED`、`INCOMPLETE` 与 `INCOMPLETE | RESET` 三种取值；
///   其它组合对核心而言视同 `DEFAULT`，是否有意义由传输实现自行约定。
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct Intercept(u8);

impl Intercept {
    /// 无意见。
    pub const DEFAULT: Intercept = Intercept(0);
    /// 单元已完成。
    pub const COMPLETED: Intercept = Intercept(0b001);
    /// 单元未完成。
    pub const INCOMPLETE: Intercept = Intercept(0b010);
    /// 请求为下一个分片重新布防。
    pub const RESET: Intercept = Intercept(0b100);

    /// 原始位图。
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// 是否包含 `other` 的全部标志位。
    pub const fn contains(self, other: Intercept) -> bool {
        self.0 & other.0 == other.0
    }

    /// 传输层是否应继续为该拦截器投递分片。
    ///
    /// 仅当标志位为 `INCOMPLETE`（可附带 `RESET`）且不含 `COMPLETED` 时返回 `true`。
    pub const fn wants_more(self) -> bool {
        self.contains(Intercept::INCOMPLETE) && !self.contains(Intercept::COMPLETED)
    }
}

impl BitOr for Intercept {
    type Output = Intercept;

    fn bitor(self, rhs: Intercept) -> Intercept {
        Intercept(self.0 | rhs.0)
    }
}

impl BitOrAssign for Intercept {
    fn bitor_assign(&mut self, rhs: Intercept) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Intercept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("Intercept(DEFAULT)");
        }
        let mut names = Vec::with_capacity(3);
        if self.contains(Intercept::COMPLETED) {
            names.push("COMPLETED");
        }
        if self.contains(Intercept::INCOMPLETE) {
            names.push("INCOMPLETE");
        }
        if self.contains(Intercept::RESET) {
            names.push("RESET");
        }
        write!(f, "Intercept({})", names.join(" | "))
    }
}

/// 传输层投递给拦截器的读事件。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadEvent {
    /// 一个原始数据分片，可能为空。
    Fragment(Bytes),
    /// 对端关闭或读方向结束。
    EndOfStream,
    /// 读失败，本次读序列终止。
    Failed(TransportError),
}

/// 读拦截器：传输层与增量读取器之间的接缝。
///
/// - **契约 (What)**：传输层对同一连接按到达顺序、逐个调用 `intercept`；
///   返回值决定是否继续投递（参见 [`Intercept::wants_more`]）；
/// - **并发 (Concurrency)**：同一拦截器不会被并发调用，因此签名为 `&mut self`；
///   跨线程移交时由传输实现提供 happens-before 边。
pub trait Interceptor: Send {
    /// 处理一次读事件。
    fn intercept(&mut self, event: ReadEvent) -> Intercept;
}

impl<F> Interceptor for F
where
    F: FnMut(ReadEvent) -> Intercept + Send,
{
    fn intercept(&mut self, event: ReadEvent) -> Intercept {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_flags_keep_each_bit() {
        let flags = Intercept::INCOMPLETE | Intercept::RESET;
        assert!(flags.contains(Intercept::INCOMPLETE));
        assert!(flags.contains(Intercept::RESET));
        assert!(!flags.contains(Intercept::COMPLETED));
        assert!(flags.wants_more());
        assert_eq!(format!("{flags:?}"), "Intercept(INCOMPLETE | RESET)");
    }

    #[test]
    fn completed_never_wants_more() {
        assert!(!Intercept::COMPLETED.wants_more());
        assert!(!(Intercept::COMPLETED | Intercept::INCOMPLETE).wants_more());
        assert!(!Intercept::DEFAULT.wants_more());
    }

    #[test]
    fn closures_act_as_interceptors() {
        let mut seen = 0usize;
        {
            let mut interceptor = |event: ReadEvent| {
                if let ReadEvent::Fragment(bytes) = event {
                    seen += bytes.len();
                }
                Intercept::INCOMPLETE
            };
            let flags = interceptor.intercept(ReadEvent::Fragment(Bytes::from_static(b"abc")));
            assert_eq!(flags, Intercept::INCOMPLETE);
        }
        assert_eq!(seen, 3);
    }
}
