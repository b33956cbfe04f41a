use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::OnceLock;

use crate::attributes::{Attribute, AttributeRegistry};
use crate::error::CoreError;

/// 类型标记：以“缓存条目类型”作为属性值类型在注册表中占位，不携带任何数据。
struct CacheSlot<T>(PhantomData<fn() -> T>);

/// 对象缓存的类型注册表，与属性注册表共用“名称 → 单调槽位”的分配方式。
fn cache_types() -> &'static AttributeRegistry {
    static TYPES: OnceLock<AttributeRegistry> = OnceLock::new();
    TYPES.get_or_init(AttributeRegistry::new)
}

/// 可缓存类型的稳定索引。
///
/// 同一名称总是得到同一索引；同名但类型不同时返回 `attribute.type_mismatch`。
pub struct CachedType<T> {
    slot: Attribute<CacheSlot<T>>,
}

impl<T: Send + 'static> CachedType<T> {
    /// 按名称登记类型。
    pub fn register(name: &str) -> Result<Self, CoreError> {
        Ok(Self {
            slot: cache_types().declare::<CacheSlot<T>>(name)?,
        })
    }

    /// 稳定索引。
    pub fn index(&self) -> usize {
        self.slot.index()
    }

    pub fn name(&self) -> &str {
        self.slot.name()
    }
}

impl<T> Clone for CachedType<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> fmt::Debug for CachedType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedType")
            .field("index", &self.slot.index())
            .field("name", &self.slot.name())
            .finish()
    }
}

/// 线程独占的对象缓存。
///
/// # 教案级说明
/// - **意图 (Why)**：解析器草稿、临时集合等对象在每个请求中都要用到，逐个分配会在热路径上产生大量短命对象；
/// - **逻辑 (How)**：每个类型索引对应一个类型擦除的 `Vec<T>`（首次 `put` 时创建），`take`/`put` 即 `pop`/`push`，
///   对象本身不再额外装箱；
/// - **契约 (What)**：每种类型至多缓存 `max_per_type` 个对象，超出时 `put` 返回 `false` 并丢弃对象；
///   只由宿主线程访问，不加任何锁。
pub struct ObjectCache {
    max_per_type: usize,
    lists: Vec<Option<Box<dyn Any + Send>>>,
}

impl ObjectCache {
    pub fn new(max_per_type: usize) -> Self {
        Self {
            max_per_type,
            lists: Vec::new(),
        }
    }

    /// 取出一个缓存对象。
    pub fn take<T: Send + 'static>(&mut self, ty: &CachedType<T>) -> Option<T> {
        self.list_mut(ty)?.pop()
    }

    /// 放回对象；缓存已满时丢弃并返回 `false`。
    pub fn put<T: Send + 'static>(&mut self, ty: &CachedType<T>, value: T) -> bool {
        let index = ty.index();
        if index >= self.lists.len() {
            self.lists.resize_with(index + 1, || None);
        }
        let slot = &mut self.lists[index];
        if slot.is_none() {
            *slot = Some(Box::new(Vec::<T>::new()));
        }
        let Some(list) = slot.as_mut().and_then(|list| list.downcast_mut::<Vec<T>>()) else {
            return false;
        };
        if list.len() >= self.max_per_type {
            return false;
        }
        list.push(value);
        true
    }

    /// 某类型当前缓存的对象数。
    pub fn len_of<T: Send + 'static>(&self, ty: &CachedType<T>) -> usize {
        self.lists
            .get(ty.index())
            .and_then(Option::as_ref)
            .and_then(|list| list.downcast_ref::<Vec<T>>())
            .map_or(0, Vec::len)
    }

    /// 丢弃全部缓存对象。
    pub fn clear(&mut self) {
        self.lists.clear();
    }

    pub fn max_per_type(&self) -> usize {
        self.max_per_type
    }

    fn list_mut<T: Send + 'static>(&mut self, ty: &CachedType<T>) -> Option<&mut Vec<T>> {
        self.lists
            .get_mut(ty.index())?
            .as_mut()?
            .downcast_mut::<Vec<T>>()
    }
}

impl fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("max_per_type", &self.max_per_type)
            .field("types", &self.lists.iter().filter(|list| list.is_some()).count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    #[test]
    fn same_name_yields_same_index() {
        let first = CachedType::<Vec<u8>>::register("cache.test.scratch").expect("登记");
        let again = CachedType::<Vec<u8>>::register("cache.test.scratch").expect("再次登记");
        assert_eq!(first.index(), again.index());
        let err = CachedType::<String>::register("cache.test.scratch").expect_err("类型冲突");
        assert_eq!(err.code(), codes::ATTRIBUTE_TYPE_MISMATCH);
    }

    #[test]
    fn put_respects_per_type_bound() {
        let ty = CachedType::<String>::register("cache.test.strings").expect("登记");
        let mut cache = ObjectCache::new(2);
        assert!(cache.take(&ty).is_none());
        assert!(cache.put(&ty, "a".to_owned()));
        assert!(cache.put(&ty, "b".to_owned()));
        assert!(!cache.put(&ty, "c".to_owned()));
        assert_eq!(cache.len_of(&ty), 2);
        assert_eq!(cache.take(&ty).as_deref(), Some("b"));
    }
}
