//! 索引化属性槽位：注册表分配稳定槽位，持有者以稀疏数组存放取值。
//!
//! # 教案级导览
//!
//! ## 意图（Why）
//! - 连接、线程、处理链上下文都需要挂接“由其它层声明的状态”，例如会话句柄、解析器草稿、认证结果；
//!   若为每类状态新增字段或子类型，核心将与所有协议层耦合；
//! - 以“名称 → 单调槽位”的注册表配合按槽位寻址的持有者，读写都是 O(1) 的数组访问，无需反射。
//!
//! ## 结构（How）
//! - [`AttributeRegistry`]：`spin::RwLock` 保护的名称表与描述符数组，读多写少；声明按名称幂等；
//! - [`Attribute<T>`]：带类型的轻量句柄，携带槽位、名称、所属注册表编号与默认值；
//! - [`AttributeHolder`]：单写者容器，内部为 `Vec<Option<Box<dyn Any + Send>>>`，
//!   并以“已写入槽位列表”支撑 O(已写入数) 的 `clear`；来自其它注册表的句柄落入按名称寻址的后备表。
//!
//! ## 契约（What）
//! - 槽位只增不减、永不复用，同名声明返回同一槽位；
//! - 持有者不加锁，跨线程移交依赖外部的 happens-before 边（池的获取/归还、任务投递）；
//! - 工厂默认值在每个持有者上至多物化一次，`remove`/`clear` 之后再次访问会重新物化。

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use spin::RwLock;
use thiserror::Error;

use crate::configuration::AttributeSettings;
use crate::error::{CoreError, codes};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// 属性默认值。
enum AttributeDefault<T> {
    Absent,
    Value(Arc<T>),
    Factory(Arc<dyn Fn() -> T + Send + Sync>),
}

impl<T> Clone for AttributeDefault<T> {
    fn clone(&self) -> Self {
        match self {
            AttributeDefault::Absent => AttributeDefault::Absent,
            AttributeDefault::Value(value) => AttributeDefault::Value(Arc::clone(value)),
            AttributeDefault::Factory(factory) => AttributeDefault::Factory(Arc::clone(factory)),
        }
    }
}

/// 类型擦除后的属性描述，供按名称或按槽位查询。
#[derive(Clone)]
pub struct AttributeDescriptor {
    index: usize,
    name: Arc<str>,
    type_id: TypeId,
    type_name: &'static str,
    default: Arc<dyn Any + Send + Sync>,
}

impl AttributeDescriptor {
    /// 槽位。
    pub fn index(&self) -> usize {
        self.index
    }

    /// 名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 值类型名称，仅用于诊断。
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// 是否以 `T` 为值类型声明。
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl fmt::Debug for AttributeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeDescriptor")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("type", &self.type_name)
            .finish()
    }
}

/// 带类型的属性句柄。克隆只复制两个 `Arc`。
pub struct Attribute<T> {
    index: usize,
    name: Arc<str>,
    registry_id: u64,
    default: AttributeDefault<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Attribute<T> {
    /// 槽位。
    pub fn index(&self) -> usize {
        self.index
    }

    /// 名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 所属注册表编号。
    pub fn registry_id(&self) -> u64 {
        self.registry_id
    }

    /// 固定默认值；未配置或配置为工厂时返回 `None`。
    pub fn default_value(&self) -> Option<&T> {
        match &self.default {
            AttributeDefault::Value(value) => Some(&**value),
            _ => None,
        }
    }

    /// 是否配置了工厂默认值。
    pub fn has_factory(&self) -> bool {
        matches!(self.default, AttributeDefault::Factory(_))
    }
}

impl<T> Clone for Attribute<T> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            name: Arc::clone(&self.name),
            registry_id: self.registry_id,
            default: self.default.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Attribute<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("registry", &self.registry_id)
            .field("type", &type_name::<T>())
            .finish()
    }
}

/// 属性声明错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AttributeError {
    #[error("attribute `{name}` was declared as `{declared}` but requested as `{requested}`")]
    TypeMismatch {
        name: String,
        declared: &'static str,
        requested: &'static str,
    },

    #[error("attribute registry exhausted its {limit} slots while declaring `{name}`")]
    SlotsExhausted { name: String, limit: usize },
}

impl From<AttributeError> for CoreError {
    fn from(value: AttributeError) -> Self {
        let code = match value {
            AttributeError::TypeMismatch { .. } => codes::ATTRIBUTE_TYPE_MISMATCH,
            AttributeError::SlotsExhausted { .. } => codes::ATTRIBUTE_SLOTS_EXHAUSTED,
        };
        CoreError::new(code, value.to_string()).with_cause(value)
    }
}

#[derive(Default)]
struct RegistryTable {
    by_name: HashMap<Arc<str>, usize>,
    slots: Vec<AttributeDescriptor>,
}

/// 名称到槽位的注册表。
///
/// # 契约说明（What）
/// - `declare*`：按名称幂等，已存在时直接返回既有句柄并忽略本次传入的默认值；
///   值类型不同则返回 `attribute.type_mismatch`；
/// - 并发声明同一新名称时只有一个调用者分配槽位，其余调用者拿到同一句柄（写锁内二次检查）；
/// - `descriptor(index)` 为 O(1) 数组访问。
///
/// # 设计取舍（Trade-offs）
/// - 读路径只取读锁；声明通常集中在启动期，写锁竞争可以忽略。
pub struct AttributeRegistry {
    id: u64,
    slot_limit: usize,
    table: RwLock<RegistryTable>,
}

impl AttributeRegistry {
    /// 以默认槽位上限创建注册表。
    pub fn new() -> Self {
        Self::with_slot_limit(AttributeSettings::default().slot_limit)
    }

    /// 指定槽位上限。
    pub fn with_slot_limit(slot_limit: usize) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            slot_limit,
            table: RwLock::new(RegistryTable::default()),
        }
    }

    /// 进程级共享注册表，连接与处理链上下文默认使用它。
    pub fn shared() -> &'static AttributeRegistry {
        static SHARED: OnceLock<AttributeRegistry> = OnceLock::new();
        SHARED.get_or_init(AttributeRegistry::new)
    }

    /// 注册表编号，进程内唯一。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 已分配槽位数。
    pub fn len(&self) -> usize {
        self.table.read().slots.len()
    }

    /// 是否尚未声明任何属性。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 声明无默认值的属性。
    pub fn declare<T>(&self, name: &str) -> Result<Attribute<T>, CoreError>
    where
        T: Send + Sync + 'static,
    {
        self.declare_inner(name, AttributeDefault::Absent)
    }

    /// 声明带固定默认值的属性。
    pub fn declare_with_default<T>(&self, name: &str, default: T) -> Result<Attribute<T>, CoreError>
    where
        T: Send + Sync + 'static,
    {
        self.declare_inner(name, AttributeDefault::Value(Arc::new(default)))
    }

    /// 声明带工厂默认值的属性，工厂在每个持有者上首次 `get` 时调用。
    pub fn declare_with_factory<T, F>(
        &self,
        name: &str,
        factory: F,
    ) -> Result<Attribute<T>, CoreError>
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.declare_inner(name, AttributeDefault::Factory(Arc::new(factory)))
    }

    /// 按名称查询描述。
    pub fn resolve(&self, name: &str) -> Option<AttributeDescriptor> {
        let table = self.table.read();
        table.by_name.get(name).map(|&index| table.slots[index].clone())
    }

    /// 按名称查询并恢复类型化句柄；类型不符时返回 `None`。
    pub fn resolve_typed<T>(&self, name: &str) -> Option<Attribute<T>>
    where
        T: Send + Sync + 'static,
    {
        let descriptor = self.resolve(name)?;
        self.typed_handle(&descriptor).ok()
    }

    /// 按槽位查询描述。
    pub fn descriptor(&self, index: usize) -> Option<AttributeDescriptor> {
        self.table.read().slots.get(index).cloned()
    }

    fn declare_inner<T>(
        &self,
        name: &str,
        default: AttributeDefault<T>,
    ) -> Result<Attribute<T>, CoreError>
    where
        T: Send + Sync + 'static,
    {
        if let Some(existing) = self.resolve(name) {
            return self.typed_handle(&existing);
        }

        let mut table = self.table.write();
        if let Some(&index) = table.by_name.get(name) {
            let existing = table.slots[index].clone();
            drop(table);
            return self.typed_handle(&existing);
        }
        if table.slots.len() >= self.slot_limit {
            return Err(AttributeError::SlotsExhausted {
                name: name.to_owned(),
                limit: self.slot_limit,
            }
            .into());
        }

        let index = table.slots.len();
        let name: Arc<str> = Arc::from(name);
        table.slots.push(AttributeDescriptor {
            index,
            name: Arc::clone(&name),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            default: Arc::new(default.clone()),
        });
        table.by_name.insert(Arc::clone(&name), index);
        Ok(Attribute {
            index,
            name,
            registry_id: self.id,
            default,
            _marker: PhantomData,
        })
    }

    fn typed_handle<T>(&self, descriptor: &AttributeDescriptor) -> Result<Attribute<T>, CoreError>
    where
        T: Send + Sync + 'static,
    {
        let mismatch = || AttributeError::TypeMismatch {
            name: descriptor.name.to_string(),
            declared: descriptor.type_name,
            requested: type_name::<T>(),
        };
        if !descriptor.is::<T>() {
            return Err(mismatch().into());
        }
        let default = descriptor
            .default
            .downcast_ref::<AttributeDefault<T>>()
            .ok_or_else(mismatch)?
            .clone();
        Ok(Attribute {
            index: descriptor.index,
            name: Arc::clone(&descriptor.name),
            registry_id: self.id,
            default,
            _marker: PhantomData,
        })
    }
}

impl Default for AttributeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AttributeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeRegistry")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("slot_limit", &self.slot_limit)
            .finish()
    }
}

type Slot = Option<Box<dyn Any + Send>>;

/// 单个对象的属性容器。
///
/// # 契约说明（What）
/// - **单写者**：不提供内部同步，跨线程移交必须经过外部同步点；
/// - **存储**：本注册表的句柄按槽位寻址，存储按需增长到所需槽位；
///   其它注册表（或 `detached` 持有者）的句柄按名称寻址；
/// - **清理**：`clear` 仅遍历曾写入的槽位，未使用的持有者清理为 O(1)。
#[derive(Default)]
pub struct AttributeHolder {
    registry_id: Option<u64>,
    slots: Vec<Slot>,
    occupied: Vec<usize>,
    fallback: HashMap<Arc<str>, Box<dyn Any + Send>>,
}

impl AttributeHolder {
    /// 绑定到 `registry`，并预留当前已声明的槽位。
    pub fn new(registry: &AttributeRegistry) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(registry.len(), || None);
        Self {
            registry_id: Some(registry.id()),
            slots,
            occupied: Vec::new(),
            fallback: HashMap::new(),
        }
    }

    /// 不绑定任何注册表，全部取值走按名称的后备表。
    pub fn detached() -> Self {
        Self::default()
    }

    /// 读取取值；未设置时返回默认值，工厂默认值在此物化并保存。
    pub fn get<'a, T>(&'a mut self, attribute: &'a Attribute<T>) -> Option<&'a T>
    where
        T: Send + Sync + 'static,
    {
        self.materialize(attribute);
        match self.stored(attribute) {
            Some(value) => Some(value),
            None => attribute.default_value(),
        }
    }

    /// 只读访问，不触发工厂物化。
    pub fn peek<'a, T>(&'a self, attribute: &'a Attribute<T>) -> Option<&'a T>
    where
        T: Send + Sync + 'static,
    {
        self.stored(attribute).or_else(|| attribute.default_value())
    }

    /// 可变访问；仅工厂默认值会被物化，固定默认值不会被复制进持有者。
    pub fn get_mut<T>(&mut self, attribute: &Attribute<T>) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.materialize(attribute);
        self.slot_mut(attribute)?.downcast_mut::<T>()
    }

    /// 写入取值，返回旧值。
    pub fn set<T>(&mut self, attribute: &Attribute<T>, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        let boxed: Box<dyn Any + Send> = Box::new(value);
        let previous = if self.owns(attribute) {
            let index = attribute.index;
            if index >= self.slots.len() {
                self.slots.resize_with(index + 1, || None);
            }
            let slot = &mut self.slots[index];
            if slot.is_none() {
                self.occupied.push(index);
            }
            slot.replace(boxed)
        } else {
            self.fallback.insert(Arc::clone(&attribute.name), boxed)
        };
        previous.and_then(|old| old.downcast::<T>().ok()).map(|old| *old)
    }

    /// 移除显式取值，之后的读取回落到默认值。
    pub fn remove<T>(&mut self, attribute: &Attribute<T>) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        let removed = if self.owns(attribute) {
            let index = attribute.index;
            let removed = self.slots.get_mut(index)?.take()?;
            if let Some(position) = self.occupied.iter().position(|&slot| slot == index) {
                self.occupied.swap_remove(position);
            }
            removed
        } else {
            self.fallback.remove(attribute.name())?
        };
        removed.downcast::<T>().ok().map(|value| *value)
    }

    /// 是否存在显式（或已物化的）取值。
    pub fn is_set<T>(&self, attribute: &Attribute<T>) -> bool {
        if self.owns(attribute) {
            matches!(self.slots.get(attribute.index), Some(Some(_)))
        } else {
            self.fallback.contains_key(attribute.name())
        }
    }

    /// 已写入的取值数量。
    pub fn len(&self) -> usize {
        self.occupied.len() + self.fallback.len()
    }

    /// 是否没有任何取值。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空全部取值，保留已分配的槽位存储以便复用。
    pub fn clear(&mut self) {
        for index in self.occupied.drain(..) {
            if let Some(slot) = self.slots.get_mut(index) {
                *slot = None;
            }
        }
        if !self.fallback.is_empty() {
            self.fallback.clear();
        }
    }

    fn owns<T>(&self, attribute: &Attribute<T>) -> bool {
        self.registry_id == Some(attribute.registry_id)
    }

    fn materialize<T>(&mut self, attribute: &Attribute<T>)
    where
        T: Send + Sync + 'static,
    {
        if let AttributeDefault::Factory(factory) = &attribute.default {
            if !self.is_set(attribute) {
                self.set(attribute, factory());
            }
        }
    }

    fn stored<T>(&self, attribute: &Attribute<T>) -> Option<&T>
    where
        T: 'static,
    {
        let boxed = if self.owns(attribute) {
            self.slots.get(attribute.index)?.as_ref()?
        } else {
            self.fallback.get(attribute.name())?
        };
        (**boxed).downcast_ref::<T>()
    }

    fn slot_mut<T>(&mut self, attribute: &Attribute<T>) -> Option<&mut Box<dyn Any + Send>> {
        if self.owns(attribute) {
            self.slots.get_mut(attribute.index)?.as_mut()
        } else {
            self.fallback.get_mut(attribute.name())
        }
    }
}

impl fmt::Debug for AttributeHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeHolder")
            .field("registry", &self.registry_id)
            .field("capacity", &self.slots.len())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn declaring_twice_returns_first_slot_and_default() {
        let registry = AttributeRegistry::new();
        let first = registry.declare_with_default("retries", 3u32).expect("声明");
        let again = registry.declare_with_default("retries", 9u32).expect("重复声明");
        assert_eq!(first.index(), again.index());
        assert_eq!(again.default_value(), Some(&3));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn mismatched_type_is_a_configuration_error() {
        let registry = AttributeRegistry::new();
        registry.declare::<u32>("peer").expect("声明");
        let err = registry.declare::<String>("peer").expect_err("类型不符");
        assert_eq!(err.code(), codes::ATTRIBUTE_TYPE_MISMATCH);
        assert!(registry.resolve_typed::<String>("peer").is_none());
        assert!(registry.resolve_typed::<u32>("peer").is_some());
    }

    #[test]
    fn slot_limit_is_enforced() {
        let registry = AttributeRegistry::with_slot_limit(1);
        registry.declare::<u8>("a").expect("第一个槽位");
        let err = registry.declare::<u8>("b").expect_err("槽位耗尽");
        assert_eq!(err.code(), codes::ATTRIBUTE_SLOTS_EXHAUSTED);
        assert!(registry.declare::<u8>("a").is_ok(), "已存在的名称仍可解析");
    }

    #[test]
    fn factory_runs_once_per_holder_until_removed() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let registry = AttributeRegistry::new();
        let scratch = registry
            .declare_with_factory("scratch", || {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Vec::<u8>::with_capacity(16)
            })
            .expect("声明");
        let mut holder = AttributeHolder::new(&registry);
        assert!(holder.peek(&scratch).is_none());
        holder.get(&scratch);
        holder.get(&scratch);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        holder.get_mut(&scratch).expect("已物化").push(7);
        assert_eq!(holder.remove(&scratch), Some(vec![7]));
        holder.get(&scratch);
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn foreign_handles_use_name_fallback() {
        let home = AttributeRegistry::new();
        let foreign = AttributeRegistry::new();
        let local = home.declare::<u16>("port").expect("声明");
        let other = foreign.declare::<u16>("port").expect("声明");

        let mut holder = AttributeHolder::new(&home);
        holder.set(&local, 80);
        holder.set(&other, 8080);
        assert_eq!(holder.peek(&local), Some(&80));
        assert_eq!(holder.peek(&other), Some(&8080));
        assert_eq!(holder.len(), 2);

        holder.clear();
        assert!(holder.is_empty());
        assert!(!holder.is_set(&local));
    }

    #[test]
    fn set_grows_storage_for_late_declarations() {
        let registry = AttributeRegistry::new();
        let mut holder = AttributeHolder::new(&registry);
        let late = registry.declare::<&'static str>("late").expect("声明");
        assert_eq!(holder.set(&late, "v1"), None);
        assert_eq!(holder.set(&late, "v2"), Some("v1"));
        assert_eq!(holder.len(), 1);
    }
}
