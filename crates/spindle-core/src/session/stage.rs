use std::sync::Arc;

use super::{CloseFrame, Frame, FrameKind, Session};
use crate::attributes::{Attribute, AttributeRegistry};
use crate::chain::{Directive, Stage, StageContext};
use crate::error::{CoreError, codes};

const FRAME_ATTRIBUTE: &str = "spindle.session.frame";
const SESSION_ATTRIBUTE: &str = "spindle.session.handle";

/// 把已解码的帧分派到会话回调的终端阶段。
///
/// # 教案级说明
/// - **意图 (Why)**：协议解析阶段只负责产出 [`Frame`]，会话语义集中在这里，解析器无需知道监听者；
/// - **逻辑 (How)**：从调用级属性取走本轮的帧，从连接级属性读取 `Arc<Session>`，按帧类别调用对应回调；
/// - **契约 (What)**：本轮无帧时直接 `Invoke`；连接上未绑定会话返回 `session.missing`；
///   关闭帧处理后返回 `Stop`，其余返回 `Invoke`。
#[derive(Debug)]
pub struct SessionDispatchStage {
    frame: Attribute<Frame>,
    session: Attribute<Arc<Session>>,
}

impl SessionDispatchStage {
    /// 在共享注册表上声明两个属性。
    pub fn new() -> Result<Self, CoreError> {
        let registry = AttributeRegistry::shared();
        Ok(Self {
            frame: registry.declare(FRAME_ATTRIBUTE)?,
            session: registry.declare(SESSION_ATTRIBUTE)?,
        })
    }

    /// 调用级属性：解析阶段写入的帧。
    pub fn frame_attribute(&self) -> &Attribute<Frame> {
        &self.frame
    }

    /// 连接级属性：连接绑定的会话。
    pub fn session_attribute(&self) -> &Attribute<Arc<Session>> {
        &self.session
    }
}

impl Stage for SessionDispatchStage {
    fn label(&self) -> &str {
        "session-dispatch"
    }

    fn process(&self, ctx: &mut StageContext<'_>) -> Result<Directive, CoreError> {
        let Some(frame) = ctx.invocation().remove(&self.frame) else {
            return Ok(Directive::Invoke);
        };
        let session = ctx.connection().peek(&self.session).cloned().ok_or_else(|| {
            CoreError::new(codes::SESSION_MISSING, "no session bound to the connection")
        })?;

        match frame.kind() {
            FrameKind::Text | FrameKind::Binary if frame.is_final() => session.on_message(&frame),
            FrameKind::Text | FrameKind::Binary | FrameKind::Continuation => {
                session.on_fragment(&frame)
            }
            FrameKind::Ping => session.on_ping(frame.payload().clone())?,
            FrameKind::Pong => session.on_pong(frame.payload()),
            FrameKind::Close => {
                session.on_close(frame.as_close().unwrap_or_else(CloseFrame::normal))?;
                return Ok(Directive::Stop);
            }
        }
        Ok(Directive::Invoke)
    }
}
