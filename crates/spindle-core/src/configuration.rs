//! 核心运行参数。
//!
//! # 教案级说明
//! - **意图 (Why)**：竞技场每级上限、事务超时、`Rerun` 上限等都是部署旋钮而非架构常量，
//!   需要从配置文件注入并在启动时一次性校验；
//! - **契约 (What)**：[`CoreSettings::from_toml_str`] 解析 TOML 后立即调用 [`CoreSettings::validate`]，
//!   任一字段非法都以 [`ConfigError`] 报告并指出字段路径；未知键被拒绝，缺省键取默认值；
//! - **实现 (How)**：各段落以 `serde` 反序列化，字段路径由 [`ConfigField`] 统一渲染，避免调用点手写字符串。

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use spindle_buffer::ArenaLimits;
use thiserror::Error;

use crate::error::{CoreError, codes};

/// 完整配置。
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CoreSettings {
    pub worker: WorkerSettings,
    pub chain: ChainSettings,
    pub attributes: AttributeSettings,
}

impl CoreSettings {
    /// 解析并校验 TOML 文本。
    ///
    /// ```rust
    /// use spindle_core::configuration::CoreSettings;
    ///
    /// let settings = CoreSettings::from_toml_str(
    ///     "[worker]\nthreads = 2\ntransaction_timeout_ms = 0\n",
    /// )
    /// .expect("合法配置");
    /// assert_eq!(settings.worker.threads, 2);
    /// assert!(settings.worker.transaction_timeout().is_none());
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: CoreSettings = toml::from_str(text).map_err(|err| ConfigError::Parse {
            detail: err.to_string(),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// 校验全部段落。
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.worker.validate()?;
        self.chain.validate()?;
        self.attributes.validate()
    }
}

/// 工作线程段落。
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    /// 线程数量。
    pub threads: usize,
    /// 线程名前缀，实际名称为 `<prefix>-<序号>`。
    pub name_prefix: String,
    /// 任务队列容量，`0` 表示无界。
    pub queue_capacity: usize,
    /// 事务超时（毫秒），`0` 表示不限。
    pub transaction_timeout_ms: u64,
    pub arena_min_class_bytes: usize,
    pub arena_max_class_bytes: usize,
    pub arena_max_buffers_per_class: usize,
    /// 对象缓存每种类型的上限。
    pub object_cache_max_per_type: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let arena = ArenaLimits::default();
        Self {
            threads: 4,
            name_prefix: "spindle-worker".to_owned(),
            queue_capacity: 0,
            transaction_timeout_ms: 0,
            arena_min_class_bytes: arena.min_class_bytes,
            arena_max_class_bytes: arena.max_class_bytes,
            arena_max_buffers_per_class: arena.max_buffers_per_class,
            object_cache_max_per_type: 32,
        }
    }
}

impl WorkerSettings {
    /// 事务超时；`None` 表示不限。
    pub fn transaction_timeout(&self) -> Option<Duration> {
        (self.transaction_timeout_ms > 0)
            .then(|| Duration::from_millis(self.transaction_timeout_ms))
    }

    /// 换算为竞技场边界。
    pub fn arena_limits(&self) -> ArenaLimits {
        ArenaLimits {
            min_class_bytes: self.arena_min_class_bytes,
            max_class_bytes: self.arena_max_class_bytes,
            max_buffers_per_class: self.arena_max_buffers_per_class,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::invalid(ConfigField::WorkerThreads, "must be at least 1"));
        }
        if self.name_prefix.trim().is_empty() {
            return Err(ConfigError::invalid(ConfigField::WorkerNamePrefix, "must not be blank"));
        }
        if self.arena_min_class_bytes == 0 {
            return Err(ConfigError::invalid(
                ConfigField::ArenaMinClassBytes,
                "must be greater than zero",
            ));
        }
        if self.arena_max_class_bytes < self.arena_min_class_bytes {
            return Err(ConfigError::invalid(
                ConfigField::ArenaMaxClassBytes,
                "must not be smaller than arena_min_class_bytes",
            ));
        }
        if self.arena_max_class_bytes > 1 << 30 {
            return Err(ConfigError::invalid(
                ConfigField::ArenaMaxClassBytes,
                "must not exceed 1 GiB",
            ));
        }
        Ok(())
    }
}

/// 处理链段落。
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ChainSettings {
    /// 同一阶段连续返回 `Rerun` 的上限，超出即视为阶段失败。
    pub max_consecutive_reruns: u32,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            max_consecutive_reruns: 1024,
        }
    }
}

impl ChainSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_consecutive_reruns == 0 {
            return Err(ConfigError::invalid(
                ConfigField::ChainMaxConsecutiveReruns,
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// 属性注册表段落。
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AttributeSettings {
    /// 单个注册表可分配的槽位上限。
    pub slot_limit: usize,
}

impl Default for AttributeSettings {
    fn default() -> Self {
        Self { slot_limit: 65_536 }
    }
}

impl AttributeSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_limit == 0 {
            return Err(ConfigError::invalid(
                ConfigField::AttributeSlotLimit,
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// 可被校验报告的字段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigField {
    WorkerThreads,
    WorkerNamePrefix,
    ArenaMinClassBytes,
    ArenaMaxClassBytes,
    ChainMaxConsecutiveReruns,
    AttributeSlotLimit,
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigField::WorkerThreads => "worker.threads",
            ConfigField::WorkerNamePrefix => "worker.name_prefix",
            ConfigField::ArenaMinClassBytes => "worker.arena_min_class_bytes",
            ConfigField::ArenaMaxClassBytes => "worker.arena_max_class_bytes",
            ConfigField::ChainMaxConsecutiveReruns => "chain.max_consecutive_reruns",
            ConfigField::AttributeSlotLimit => "attributes.slot_limit",
        })
    }
}

/// 配置错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to parse configuration: {detail}")]
    Parse { detail: String },

    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: ConfigField,
        reason: &'static str,
    },
}

impl ConfigError {
    fn invalid(field: ConfigField, reason: &'static str) -> Self {
        ConfigError::Invalid { field, reason }
    }
}

impl From<ConfigError> for CoreError {
    fn from(value: ConfigError) -> Self {
        let code = match value {
            ConfigError::Parse { .. } => codes::CONFIG_PARSE,
            ConfigError::Invalid { .. } => codes::CONFIG_INVALID,
        };
        CoreError::new(code, value.to_string()).with_cause(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let settings = CoreSettings::from_toml_str("").expect("空文档合法");
        assert_eq!(settings, CoreSettings::default());
        assert_eq!(settings.chain.max_consecutive_reruns, 1024);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = CoreSettings::from_toml_str("[worker]\nthreadz = 3\n").expect_err("拼写错误应被拒绝");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn invalid_field_is_named() {
        let err = CoreSettings::from_toml_str(
            "[worker]\narena_min_class_bytes = 512\narena_max_class_bytes = 64\n",
        )
        .expect_err("上下界颠倒");
        assert_eq!(
            err.to_string(),
            "invalid value for `worker.arena_max_class_bytes`: must not be smaller than arena_min_class_bytes"
        );
        let core: CoreError = err.into();
        assert_eq!(core.code(), codes::CONFIG_INVALID);
    }

    #[test]
    fn timeout_is_converted() {
        let settings =
            CoreSettings::from_toml_str("[worker]\ntransaction_timeout_ms = 250\n").expect("合法");
        assert_eq!(
            settings.worker.transaction_timeout(),
            Some(Duration::from_millis(250))
        );
    }
}
