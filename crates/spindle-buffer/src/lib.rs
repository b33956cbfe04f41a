#![deny(unsafe_code)]

//! `spindle-buffer` 提供流水线热路径上使用的两类具体缓冲。
//!
//! # 模块定位（Why）
//! - 增量读取器需要一个“逻辑上连续、物理上分片”的消息缓冲，在分片到达时零拷贝追加，
//!   在消息完整时整体移交给处理链；
//! - 工作线程需要一个线程独占的内存竞技场，按尺寸级别复用 `BytesMut`，避免每个请求分配临时缓冲。
//!
//! # 设计概要（How）
//! - `composite` 模块实现 [`CompositeBuffer`]，内部以 `VecDeque<Bytes>` 保存分片并实现 `bytes::Buf`；
//! - `arena` 模块实现 [`ThreadArena`]，以二次幂尺寸级别为键维护自由链表，每级容量受 [`ArenaLimits`] 约束；
//! - `ThreadArena` 刻意不实现 `Sync`：它只属于一个工作线程，内部无任何锁。
//!
//! # 命名约定（Consistency）
//! - 延续 `bytes` 的术语（`Bytes`/`BytesMut`/`Buf`），避免引入额外前缀。

mod arena;
mod composite;

pub use arena::{ArenaLimits, ArenaStats, SizeClass, ThreadArena};
pub use composite::CompositeBuffer;
