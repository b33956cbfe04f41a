use std::str::Utf8Error;

use bytes::{BufMut, Bytes, BytesMut};

/// 正常关闭码。
pub const NORMAL_CLOSURE: u16 = 1000;
/// 未收到关闭帧即断开时上报给监听者的关闭码。
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// 帧类别。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FrameKind {
    Text,
    Binary,
    Continuation,
    Ping,
    Pong,
    Close,
}

/// 已解码的消息帧。掩码、分片头等线格式细节由外层协议处理。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    kind: FrameKind,
    payload: Bytes,
    fin: bool,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>, fin: bool) -> Self {
        Self {
            kind,
            payload: payload.into(),
            fin,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(FrameKind::Text, Bytes::from(text.into()), true)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Binary, payload, true)
    }

    /// 延续分片；`last` 表示这是消息的最后一片。
    pub fn continuation(payload: impl Into<Bytes>, last: bool) -> Self {
        Self::new(FrameKind::Continuation, payload, last)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Ping, payload, true)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Pong, payload, true)
    }

    /// 关闭帧，负载为大端关闭码 + UTF-8 原因。
    pub fn close(close: &CloseFrame) -> Self {
        let mut payload = BytesMut::with_capacity(2 + close.reason.len());
        payload.put_u16(close.code);
        payload.put_slice(close.reason.as_bytes());
        Self::new(FrameKind::Close, payload.freeze(), true)
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_final(&self) -> bool {
        self.fin
    }

    /// 以 UTF-8 解读负载。
    pub fn as_text(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.payload)
    }

    /// 解析关闭帧负载；非关闭帧返回 `None`，空负载视为正常关闭。
    pub fn as_close(&self) -> Option<CloseFrame> {
        if self.kind != FrameKind::Close {
            return None;
        }
        if self.payload.len() < 2 {
            return Some(CloseFrame::normal());
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let reason = String::from_utf8_lossy(&self.payload[2..]).into_owned();
        Some(CloseFrame { code, reason })
    }
}

/// 关闭码与原因。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(NORMAL_CLOSURE, "")
    }
}
