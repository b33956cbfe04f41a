//! `composite_contract` 集成测试：验证 `CompositeBuffer` 的累积、移交与流式消费契约。
//!
//! # 测试目标（Why）
//! - 增量读取器在消息完整时调用 `take` 移交快照，快照与后续累积的数据之间绝不能共享内容；
//! - 终止符判定依赖 `find`/`find_from`，必须在跨分片边界时同样正确，且不依赖拼接后的连续视图。

use bytes::{Buf, Bytes};
use proptest::prelude::*;
use spindle_buffer::CompositeBuffer;

#[test]
fn take_hands_off_snapshot_and_leaves_fresh_buffer() {
    let mut buffer = CompositeBuffer::new();
    buffer.append(Bytes::from_static(b"abcd"));
    buffer.append(Bytes::from_static(b"efgh"));

    let snapshot = CompositeBuffer::take(&mut buffer);
    assert_eq!(snapshot.len(), 8);
    assert!(buffer.is_empty());
    assert_eq!(buffer.fragment_count(), 0);

    buffer.append(Bytes::from_static(b"ij"));
    assert_eq!(snapshot.to_vec(), b"abcdefgh");
    assert_eq!(buffer.to_vec(), b"ij");
}

#[test]
fn terminator_is_found_across_fragments() {
    let buffer: CompositeBuffer = [
        Bytes::from_static(b"GET / HTTP/1.1\r"),
        Bytes::from_static(b"\n\r"),
        Bytes::from_static(b"\n"),
    ]
    .into_iter()
    .collect();
    assert_eq!(buffer.find(b"\r\n\r\n"), Some(14));
    assert!(buffer.contains_sequence(b"HTTP"));
    assert!(!buffer.contains_sequence(b"POST"));
}

#[test]
fn single_fragment_view_is_zero_copy() {
    let payload = Bytes::from_static(b"payload");
    let buffer = CompositeBuffer::from(payload.clone());
    let view = buffer.to_bytes();
    assert_eq!(view.as_ptr(), payload.as_ptr());
}

#[test]
fn copy_to_bytes_consumes_across_fragments() {
    let mut buffer: CompositeBuffer = [Bytes::from_static(b"ab"), Bytes::from_static(b"cdef")]
        .into_iter()
        .collect();
    let head = buffer.copy_to_bytes(3);
    assert_eq!(&head[..], b"abc");
    assert_eq!(buffer.remaining(), 3);
    assert_eq!(buffer.to_vec(), b"def");
}

proptest! {
    /// 任意分片序列累积后，长度与拼接结果一致，按 `Buf` 读出的字节序列与原始拼接完全相同。
    #[test]
    fn prop_accumulated_content_matches_concatenation(
        fragments in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..16),
            0..16,
        )
    ) {
        let expected: Vec<u8> = fragments.iter().flatten().copied().collect();
        let mut buffer = CompositeBuffer::new();
        for fragment in &fragments {
            buffer.append(Bytes::copy_from_slice(fragment));
        }
        prop_assert_eq!(buffer.len(), expected.len());
        let non_empty = fragments.iter().filter(|fragment| !fragment.is_empty()).count();
        prop_assert_eq!(buffer.fragment_count(), non_empty);

        let mut drained = Vec::with_capacity(expected.len());
        while buffer.has_remaining() {
            let chunk = buffer.chunk().to_vec();
            buffer.advance(chunk.len());
            drained.extend_from_slice(&chunk);
        }
        prop_assert_eq!(drained, expected);
    }

    /// 在小字母表上随机切分：逐分片查找与在连续拼接上逐窗口查找的结果一致。
    #[test]
    fn prop_find_from_agrees_with_contiguous_search(
        fragments in proptest::collection::vec(
            proptest::collection::vec(0u8..3, 0..8),
            0..12,
        ),
        needle in proptest::collection::vec(0u8..3, 1..4),
        from in 0usize..40,
    ) {
        let joined: Vec<u8> = fragments.iter().flatten().copied().collect();
        let buffer: CompositeBuffer = fragments
            .iter()
            .map(|fragment| Bytes::copy_from_slice(fragment))
            .collect();
        let expected = if from >= joined.len() {
            None
        } else {
            joined[from..]
                .windows(needle.len())
                .position(|window| window == needle.as_slice())
                .map(|offset| from + offset)
        };
        prop_assert_eq!(buffer.find_from(&needle, from), expected);
    }
}
