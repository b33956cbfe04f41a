use std::collections::VecDeque;
use std::fmt;

use bytes::{Buf, Bytes, BytesMut};

/// 由若干 `Bytes` 分片组成的逻辑消息缓冲。
///
/// # 模块角色（Why）
/// - 传输层按任意边界投递分片，协议层却需要按“完整消息”处理；该类型在两者之间累积数据，
///   追加时不复制分片内容；
/// - 实现 [`Buf`]，处理链中的 Stage 可以直接按流式方式消费，无需先拼接成连续内存。
///
/// # 契约说明（What）
/// - `len()` 始终等于所有分片长度之和，空分片不会入队；
/// - [`take`](Self::take) 将全部内容移交给调用方，并在原处留下一个全新的空缓冲，
///   移交出去的快照与后续追加的数据之间没有任何别名；
/// - [`to_bytes`](Self::to_bytes) 在单分片时零拷贝，多分片时复制一次得到连续视图。
///
/// # 设计权衡（Trade-offs）
/// - 采用 `VecDeque` 而非链表，追加与前端消费均为摊还 O(1)；
/// - `find` 逐分片比对，不产生复制；最坏情况为 O(len × needle)，适合终止符较短的场景。
#[derive(Clone, Default)]
pub struct CompositeBuffer {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl CompositeBuffer {
    /// 创建空缓冲。
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个分片；空分片被忽略。
    pub fn append(&mut self, fragment: Bytes) {
        if fragment.is_empty() {
            return;
        }
        self.len += fragment.len();
        self.chunks.push_back(fragment);
    }

    /// 逻辑总长度。
    pub fn len(&self) -> usize {
        self.len
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 当前持有的物理分片数量。
    pub fn fragment_count(&self) -> usize {
        self.chunks.len()
    }

    /// 按顺序遍历物理分片。
    pub fn chunks(&self) -> impl Iterator<Item = &Bytes> + '_ {
        self.chunks.iter()
    }

    /// 移交全部内容，原处留下空缓冲。
    pub fn take(&mut self) -> CompositeBuffer {
        std::mem::take(self)
    }

    /// 丢弃全部内容。
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// 返回连续视图。
    pub fn to_bytes(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut joined = BytesMut::with_capacity(self.len);
                for chunk in &self.chunks {
                    joined.extend_from_slice(chunk);
                }
                joined.freeze()
            }
        }
    }

    /// 复制为 `Vec<u8>`，主要供测试与日志使用。
    pub fn to_vec(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }

    /// 查找 `needle` 首次出现的逻辑偏移，跨分片边界同样有效。
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        self.find_from(needle, 0)
    }

    /// 从逻辑偏移 `from` 起查找 `needle`，返回首次出现的逻辑偏移。
    ///
    /// 逐分片比对，不拼接也不分配；起始分片从尾部向前定位，因此只扫描尾部时的开销与
    /// 扫描窗口成正比，而与缓冲中已有的分片总数无关。
    pub fn find_from(&self, needle: &[u8], from: usize) -> Option<usize> {
        let Some(&first) = needle.first() else {
            return (from <= self.len).then_some(from);
        };
        if needle.len() > self.len.saturating_sub(from) {
            return None;
        }
        let last_start = self.len - needle.len();
        let (first_chunk, mut base) = self.locate_from_back(from);
        for (index, chunk) in self.chunks.iter().enumerate().skip(first_chunk) {
            let mut offset = from.saturating_sub(base);
            while let Some(hit) = chunk[offset..].iter().position(|&byte| byte == first) {
                let start = base + offset + hit;
                if start > last_start {
                    return None;
                }
                if self.matches_at(index, offset + hit, needle) {
                    return Some(start);
                }
                offset += hit + 1;
            }
            base += chunk.len();
        }
        None
    }

    /// 包含逻辑偏移 `offset` 的分片下标及其起始偏移；要求 `offset < len`。
    fn locate_from_back(&self, offset: usize) -> (usize, usize) {
        let mut base = self.len;
        for (index, chunk) in self.chunks.iter().enumerate().rev() {
            base -= chunk.len();
            if base <= offset {
                return (index, base);
            }
        }
        (0, 0)
    }

    fn matches_at(&self, chunk: usize, offset: usize, needle: &[u8]) -> bool {
        let mut rest = needle;
        let mut offset = offset;
        for chunk in self.chunks.range(chunk..) {
            let available = &chunk[offset..];
            let n = available.len().min(rest.len());
            if available[..n] != rest[..n] {
                return false;
            }
            rest = &rest[n..];
            if rest.is_empty() {
                return true;
            }
            offset = 0;
        }
        false
    }

    /// 是否包含 `needle`。
    pub fn contains_sequence(&self, needle: &[u8]) -> bool {
        self.find(needle).is_some()
    }
}

impl Buf for CompositeBuffer {
    fn remaining(&self) -> usize {
        self.len
    }

    fn chunk(&self) -> &[u8] {
        self.chunks.front().map(|chunk| chunk.as_ref()).unwrap_or(&[])
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(
            cnt <= self.len,
            "advance 越界：cnt = {cnt}, remaining = {}",
            self.len
        );
        self.len -= cnt;
        while cnt > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if cnt < front.len() {
                front.advance(cnt);
                break;
            }
            cnt -= front.len();
            self.chunks.pop_front();
        }
    }
}

impl From<Bytes> for CompositeBuffer {
    fn from(value: Bytes) -> Self {
        let mut buffer = CompositeBuffer::new();
        buffer.append(value);
        buffer
    }
}

impl From<&'static [u8]> for CompositeBuffer {
    fn from(value: &'static [u8]) -> Self {
        CompositeBuffer::from(Bytes::from_static(value))
    }
}

impl FromIterator<Bytes> for CompositeBuffer {
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        let mut buffer = CompositeBuffer::new();
        for fragment in iter {
            buffer.append(fragment);
        }
        buffer
    }
}

impl fmt::Debug for CompositeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeBuffer")
            .field("len", &self.len)
            .field("fragments", &self.chunks.len())
            .finish()
    }
}

impl PartialEq for CompositeBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.to_bytes() == other.to_bytes()
    }
}

impl Eq for CompositeBuffer {}
