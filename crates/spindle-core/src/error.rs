use std::borrow::Cow;
use std::error::Error;
use std::fmt;

use spindle_transport::TransportError;

/// 底层原因的统一承载类型。
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// `CoreError` 是 `spindle-core` 对外暴露的唯一错误形态。
///
/// # 设计背景（Why）
/// - 处理链、属性注册表、会话状态机各自产生的故障需要合流为稳定错误码，调用方据此决定是拆除连接、
///   回退还是上报；
/// - 各子域先以 `thiserror` 枚举表达细节，再通过 `From` 汇聚到这里，调用点统一使用 `?`。
///
/// # 契约说明（What）
/// - `code`：遵循 `<领域>.<语义>` 的稳定字符串，取值见 [`codes`]；
/// - `message`：面向排障人员的描述，不得包含敏感数据；
/// - `cause`：可选底层原因，经 [`Error::source`] 暴露。
///
/// # 设计取舍（Trade-offs）
/// - 不实现 `Clone`：底层原因是任意 trait 对象；需要复制时请只复制 `code` 与 `message`。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
}

impl CoreError {
    /// 构造核心错误。
    ///
    /// ```rust
    /// use spindle_core::{CoreError, error::codes};
    ///
    /// let err = CoreError::new(codes::SESSION_CLOSED, "socket is already closed");
    /// assert_eq!(err.code(), codes::SESSION_CLOSED);
    /// assert!(err.cause().is_none());
    /// ```
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 附带底层原因并返回新的错误。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 就地设置底层原因。
    pub fn set_cause(&mut self, cause: impl Error + Send + Sync + 'static) {
        self.cause = Some(Box::new(cause));
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 描述信息。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 按错误码查得的处置分类。
    ///
    /// # 执行逻辑（How）
    /// - 先匹配少数需要单独归类的码值（例如 `chain.empty` 属于配置错误而非阶段失败）；
    /// - 其余按 `<领域>.` 前缀归类；未登记的前缀回退为 [`ErrorCategory::Internal`]。
    pub fn category(&self) -> ErrorCategory {
        match self.code {
            codes::CHAIN_EMPTY => ErrorCategory::Configuration,
            codes::READER_SOURCE_FAILED => ErrorCategory::Transport,
            code => match code.split_once('.').map(|(domain, _)| domain) {
                Some("chain") => ErrorCategory::StageFailure,
                Some("attribute" | "config") => ErrorCategory::Configuration,
                Some("session" | "protocol" | "reader") => ErrorCategory::Protocol,
                Some("transport") => ErrorCategory::Transport,
                _ => ErrorCategory::Internal,
            },
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn Error + 'static))
    }
}

impl From<TransportError> for CoreError {
    fn from(value: TransportError) -> Self {
        let code = match value {
            TransportError::Closed => codes::TRANSPORT_CLOSED,
            TransportError::Io { .. } => codes::TRANSPORT_IO,
            TransportError::Rejected { .. } => codes::TRANSPORT_REJECTED,
        };
        CoreError::new(code, value.to_string()).with_cause(value)
    }
}

/// 错误的处置分类，对应调用方的几类典型反应。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorCategory {
    /// 阶段执行失败：本轮处理终止，实例已归还，通常由调用方拆除连接。
    StageFailure,
    /// 协议层错误：在不允许的状态下调用操作，同步报告给调用方。
    Protocol,
    /// 配置或编程错误：例如槽位耗尽、属性类型冲突、空处理链。
    Configuration,
    /// 传输层上报的故障。
    Transport,
    /// 未归类的内部错误。
    Internal,
}

/// 稳定错误码表。
///
/// 错误码遵循 `<领域>.<语义>` 命名，领域前缀决定 [`ErrorCategory`]。
pub mod codes {
    /// 构建处理链时未登记任何阶段。
    pub const CHAIN_EMPTY: &str = "chain.empty";
    /// 阶段返回错误。
    pub const CHAIN_STAGE_FAILED: &str = "chain.stage_failed";
    /// 阶段执行中发生 panic。
    pub const CHAIN_STAGE_PANICKED: &str = "chain.stage_panicked";
    /// 同一阶段连续 `Rerun` 超过上限。
    pub const CHAIN_RERUN_LIMIT: &str = "chain.rerun_limit";
    /// 试图恢复一个并未挂起的处理链。
    pub const CHAIN_NOT_SUSPENDED: &str = "chain.not_suspended";
    /// 同名属性以不同的值类型重复声明。
    pub const ATTRIBUTE_TYPE_MISMATCH: &str = "attribute.type_mismatch";
    /// 属性槽位耗尽。
    pub const ATTRIBUTE_SLOTS_EXHAUSTED: &str = "attribute.slots_exhausted";
    /// 会话未连接。
    pub const SESSION_NOT_CONNECTED: &str = "session.not_connected";
    /// 会话已关闭或正在关闭。
    pub const SESSION_CLOSED: &str = "session.closed";
    /// 连接上缺少会话句柄。
    pub const SESSION_MISSING: &str = "session.missing";
    /// 协议处理器发送失败。
    pub const PROTOCOL_SEND: &str = "protocol.send";
    /// 完成判定失败。
    pub const READER_PREDICATE_FAILED: &str = "reader.predicate_failed";
    /// 数据源上报失败。
    pub const READER_SOURCE_FAILED: &str = "reader.source_failed";
    /// 配置解析失败。
    pub const CONFIG_PARSE: &str = "config.parse";
    /// 配置取值非法。
    pub const CONFIG_INVALID: &str = "config.invalid";
    /// 工作线程池已关闭。
    pub const WORKER_SHUTDOWN: &str = "worker.shutdown";
    /// 工作线程创建失败。
    pub const WORKER_SPAWN: &str = "worker.spawn";
    /// 传输连接已关闭。
    pub const TRANSPORT_CLOSED: &str = "transport.closed";
    /// 传输 I/O 失败。
    pub const TRANSPORT_IO: &str = "transport.io";
    /// 传输拒绝操作。
    pub const TRANSPORT_REJECTED: &str = "transport.rejected";
}
