use std::fmt;
use std::sync::Arc;

use super::{ChainPool, ChainSettings, Stage};
use crate::error::{CoreError, codes};

/// 处理链装配器。
///
/// # 契约说明（What）
/// - 阶段按 `stage`/`boxed` 的调用顺序执行；
/// - `build` 在没有任何阶段时返回 `chain.empty`，其余情况总是成功。
pub struct ChainBuilder {
    name: String,
    stages: Vec<Box<dyn Stage>>,
    settings: ChainSettings,
}

impl ChainBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            settings: ChainSettings::default(),
        }
    }

    /// 追加阶段。
    pub fn stage(mut self, stage: impl Stage) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// 追加已装箱的阶段。
    pub fn boxed(mut self, stage: Box<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// 覆盖执行参数。
    pub fn settings(mut self, settings: ChainSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 冻结为不可变定义。
    pub fn build(self) -> Result<ChainDefinition, CoreError> {
        if self.stages.is_empty() {
            return Err(CoreError::new(
                codes::CHAIN_EMPTY,
                format!("chain `{}` has no stages", self.name),
            ));
        }
        Ok(ChainDefinition {
            inner: Arc::new(DefinitionInner {
                name: self.name.into(),
                stages: self.stages.into_boxed_slice(),
                settings: self.settings,
            }),
        })
    }
}

impl fmt::Debug for ChainBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainBuilder")
            .field("name", &self.name)
            .field("stages", &self.stages.len())
            .finish()
    }
}

pub(super) struct DefinitionInner {
    pub(super) name: Arc<str>,
    pub(super) stages: Box<[Box<dyn Stage>]>,
    pub(super) settings: ChainSettings,
}

/// 不可变的处理链结构，克隆只增加引用计数。
#[derive(Clone)]
pub struct ChainDefinition {
    pub(super) inner: Arc<DefinitionInner>,
}

impl ChainDefinition {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 阶段数量。
    pub fn len(&self) -> usize {
        self.inner.stages.len()
    }

    /// 恒为 `false`：空链无法构建。
    pub fn is_empty(&self) -> bool {
        self.inner.stages.is_empty()
    }

    /// 按执行顺序列出阶段标签。
    pub fn labels(&self) -> impl Iterator<Item = &str> + '_ {
        self.inner.stages.iter().map(|stage| stage.label())
    }

    pub fn settings(&self) -> ChainSettings {
        self.inner.settings
    }

    /// 创建绑定到本定义的实例池。
    pub fn pool(&self) -> ChainPool {
        ChainPool::new(self.clone())
    }
}

impl fmt::Debug for ChainDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainDefinition")
            .field("name", &self.inner.name)
            .field("stages", &self.labels().collect::<Vec<_>>())
            .finish()
    }
}
