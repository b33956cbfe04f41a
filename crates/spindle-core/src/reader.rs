//! 增量读取器：把任意边界到达的分片累积成完整消息。
//!
//! # 教案级导览
//!
//! ## 意图（Why）
//! - 传输层以任意边界投递原始分片，协议层却需要“完整帧”“完整请求头”等逻辑单元；
//! - 读取器把“还需要更多数据”与“单元已完成”显式建模为 [`ReadProgress`]，
//!   既能挂到传输层的拦截协议上，也能挂到通道上以阻塞接收的方式驱动。
//!
//! ## 结构（How）
//! - [`CompletionPredicate`] 决定当前累积是否构成完整单元；
//! - [`ReadCompletion`] 接收完成或失败通知，每个逻辑单元恰好一次；
//! - [`IncrementalReader`] 持有 [`CompositeBuffer`]，完成时以 `take` 移交快照并从空缓冲重新累积；
//! - [`ChannelReader`] 把 `crossbeam_channel::Receiver<ReadEvent>` 接到读取器上，“重新布防”即下一次 `recv`。
//!
//! ## 契约（What）
//! - 源关闭后不再追加任何分片，也不产生任何通知；关闭时未完成的数据被直接丢弃；
//! - 判定函数报错时，为在途单元产生一次 `failed` 并丢弃其数据，读取器保持可用。

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use spindle_buffer::CompositeBuffer;
use spindle_transport::{ConnectionId, Intercept, Interceptor, ReadEvent};
use tracing::{debug, trace, warn};

use crate::error::{CoreError, codes};

/// 完成判定。
pub trait CompletionPredicate: Send {
    /// 判定当前累积是否已构成完整单元。
    fn evaluate(&mut self, buffer: &CompositeBuffer) -> Result<bool, CoreError>;

    /// 累积缓冲被移交或丢弃后调用，判定可据此丢弃跨分片保存的扫描进度。
    fn reset(&mut self) {}
}

impl<F> CompletionPredicate for F
where
    F: FnMut(&CompositeBuffer) -> Result<bool, CoreError> + Send,
{
    fn evaluate(&mut self, buffer: &CompositeBuffer) -> Result<bool, CoreError> {
        self(buffer)
    }
}

/// 累积字节数达到阈值即完成。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AtLeast(pub usize);

impl CompletionPredicate for AtLeast {
    fn evaluate(&mut self, buffer: &CompositeBuffer) -> Result<bool, CoreError> {
        Ok(buffer.len() >= self.0)
    }
}

/// 出现终止序列即完成，例如 `\r\n\r\n`。
///
/// 记录上次判定时已扫描的长度，下一次只检查新分片以及其前 `len - 1` 个旧字节，
/// 整条消息的判定总开销与消息长度成线性关系。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Terminator {
    sequence: Bytes,
    scanned: usize,
}

impl Terminator {
    pub fn new(sequence: impl Into<Bytes>) -> Self {
        Self {
            sequence: sequence.into(),
            scanned: 0,
        }
    }

    pub fn sequence(&self) -> &Bytes {
        &self.sequence
    }

    /// 已确认不含终止序列的前缀长度。
    pub fn scanned(&self) -> usize {
        self.scanned
    }
}

impl CompletionPredicate for Terminator {
    fn evaluate(&mut self, buffer: &CompositeBuffer) -> Result<bool, CoreError> {
        if buffer.len() < self.scanned {
            self.scanned = 0;
        }
        let overlap = self.sequence.len().saturating_sub(1);
        let from = self.scanned.saturating_sub(overlap);
        if buffer.find_from(&self.sequence, from).is_some() {
            self.scanned = 0;
            Ok(true)
        } else {
            self.scanned = buffer.len();
            Ok(false)
        }
    }

    fn reset(&mut self) {
        self.scanned = 0;
    }
}

/// 完成通知的接收方。
pub trait ReadCompletion: Send {
    /// 一个完整单元，所有权移交给接收方。
    fn completed(&mut self, message: CompositeBuffer);

    /// 在途单元失败。
    fn failed(&mut self, error: CoreError);
}

/// 单个分片处理后的进展。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadProgress {
    /// 数据不足，等待下一个分片。
    AwaitingMore,
    /// 单元已完成并已通知。
    Completed,
    /// 分片被丢弃：源已关闭，或判定失败导致在途单元作废。
    Discarded,
}

/// 每连接一个的增量读取器。
///
/// - **并发 (Concurrency)**：单写者；传输层保证同一连接的分片按到达顺序、串行投递；
/// - **所有权 (Ownership)**：累积缓冲只属于读取器，直至完成时整体移交。
pub struct IncrementalReader<P, C> {
    connection: ConnectionId,
    predicate: P,
    completion: C,
    buffer: CompositeBuffer,
    closed: bool,
    completed_messages: u64,
}

impl<P, C> IncrementalReader<P, C>
where
    P: CompletionPredicate,
    C: ReadCompletion,
{
    pub fn new(connection: ConnectionId, predicate: P, completion: C) -> Self {
        Self {
            connection,
            predicate,
            completion,
            buffer: CompositeBuffer::new(),
            closed: false,
            completed_messages: 0,
        }
    }

    /// 处理一个新到达的分片。
    pub fn on_fragment(&mut self, fragment: Bytes) -> ReadProgress {
        if self.closed {
            trace!(
                connection = %self.connection,
                len = fragment.len(),
                "reader.fragment_after_close"
            );
            return ReadProgress::Discarded;
        }
        if fragment.is_empty() {
            return ReadProgress::AwaitingMore;
        }
        trace!(connection = %self.connection, len = fragment.len(), "reader.fragment");
        self.buffer.append(fragment);
        match self.predicate.evaluate(&self.buffer) {
            Ok(true) => {
                self.predicate.reset();
                let message = self.buffer.take();
                self.completed_messages += 1;
                self.completion.completed(message);
                ReadProgress::Completed
            }
            Ok(false) => ReadProgress::AwaitingMore,
            Err(error) => {
                warn!(
                    connection = %self.connection,
                    code = error.code(),
                    buffered = self.buffer.len(),
                    "reader.predicate_failed"
                );
                self.buffer.clear();
                self.predicate.reset();
                self.completion.failed(CoreError::new(
                    codes::READER_PREDICATE_FAILED,
                    "completion predicate failed; in-flight message discarded",
                )
                .with_cause(error));
                ReadProgress::Discarded
            }
        }
    }

    /// 标记源已关闭；幂等。未完成的数据被丢弃且不产生通知。
    pub fn mark_source_closed(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!(
            connection = %self.connection,
            dropped = self.buffer.len(),
            "reader.source_closed"
        );
        self.buffer.clear();
        self.predicate.reset();
    }

    /// 源以错误终止：关闭读取器并为在途单元报告一次失败。已关闭时忽略。
    pub fn fail(&mut self, error: CoreError) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.buffer.clear();
        self.predicate.reset();
        warn!(connection = %self.connection, code = error.code(), "reader.source_failed");
        self.completion.failed(error);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 当前累积的字节数。
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// 已完成的单元数量。
    pub fn completed_messages(&self) -> u64 {
        self.completed_messages
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn completion(&self) -> &C {
        &self.completion
    }

    pub fn completion_mut(&mut self) -> &mut C {
        &mut self.completion
    }
}

impl<P, C> Interceptor for IncrementalReader<P, C>
where
    P: CompletionPredicate,
    C: ReadCompletion,
{
    fn intercept(&mut self, event: ReadEvent) -> Intercept {
        match event {
            ReadEvent::Fragment(fragment) if fragment.is_empty() && !self.closed => {
                Intercept::INCOMPLETE
            }
            ReadEvent::Fragment(fragment) => match self.on_fragment(fragment) {
                ReadProgress::AwaitingMore => Intercept::INCOMPLETE | Intercept::RESET,
                ReadProgress::Completed | ReadProgress::Discarded => Intercept::COMPLETED,
            },
            ReadEvent::EndOfStream => {
                self.mark_source_closed();
                Intercept::COMPLETED
            }
            ReadEvent::Failed(error) => {
                let message = format!("transport failed while reading: {error}");
                self.fail(CoreError::new(codes::READER_SOURCE_FAILED, message).with_cause(error));
                Intercept::COMPLETED
            }
        }
    }
}

/// 以通道驱动读取器：重新布防等价于一次阻塞接收。
///
/// # 契约说明（What）
/// - [`next_unit`](Self::next_unit) 持续接收事件直到拦截结果不再请求更多数据，返回该结果；
///   发送端全部断开时视为源关闭并返回 `None`；
/// - [`drain`](Self::drain) 反复调用 `next_unit` 直到源关闭，返回累计完成的单元数。
pub struct ChannelReader<P, C> {
    reader: IncrementalReader<P, C>,
    events: Receiver<ReadEvent>,
}

impl<P, C> ChannelReader<P, C>
where
    P: CompletionPredicate,
    C: ReadCompletion,
{
    pub fn new(reader: IncrementalReader<P, C>, events: Receiver<ReadEvent>) -> Self {
        Self { reader, events }
    }

    /// 创建无界通道并返回发送端。
    pub fn channel(reader: IncrementalReader<P, C>) -> (Sender<ReadEvent>, Self) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (sender, Self::new(reader, receiver))
    }

    /// 接收事件直到当前单元结束。
    pub fn next_unit(&mut self) -> Option<Intercept> {
        if self.reader.is_closed() {
            return None;
        }
        loop {
            let Ok(event) = self.events.recv() else {
                self.reader.mark_source_closed();
                return None;
            };
            let flags = self.reader.intercept(event);
            if !flags.wants_more() {
                return Some(flags);
            }
        }
    }

    /// 处理到源关闭为止。
    pub fn drain(&mut self) -> u64 {
        while self.next_unit().is_some() && !self.reader.is_closed() {}
        self.reader.completed_messages()
    }

    pub fn reader(&self) -> &IncrementalReader<P, C> {
        &self.reader
    }

    pub fn reader_mut(&mut self) -> &mut IncrementalReader<P, C> {
        &mut self.reader
    }

    pub fn into_inner(self) -> IncrementalReader<P, C> {
        self.reader
    }
}
