// 统一低延迟视频流传输系统 - 环形缓冲区实现
//
// 本模块实现了固定容量的包环形缓冲区。
//
// # 特性
//
// - 单写者：追加永不因读者阻塞，写满后原地覆盖最旧的槽位
// - 多读者：每个读者持有独立的读游标，互不协调
// - 序列号在频道生命周期内严格递增，永不复用
// - 落后超过一整圈的读者跳转到当前有效范围内重新同步

use common::{EncodedPacket, Rational};
use parking_lot::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 写入槽位时附带的来源信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMeta {
    /// 包时间戳的时间基
    pub time_base: Rational,
    /// 文件代数
    pub epoch: u64,
    /// 该代开始时记录的流起始时间戳（同一时间基）
    pub epoch_start_pts: i64,
}

/// 环形缓冲区中的一个槽位
#[derive(Debug, Clone)]
pub struct PacketSlot {
    pub sequence: u64,
    pub packet: EncodedPacket,
    pub time_base: Rational,
    pub epoch: u64,
    pub epoch_start_pts: i64,
}

struct RingState {
    /// `None` 表示槽位从未写入
    slots: Vec<Option<PacketSlot>>,
    write_index: Option<usize>,
    last_sequence: u64,
}

/// 包环形缓冲区
///
/// 所有读写由同一把互斥锁串行化，锁内只复制元数据与 `Bytes` 引用。
pub struct RingBuffer {
    capacity: usize,
    state: Mutex<RingState>,
}

impl RingBuffer {
    /// 创建环形缓冲区
    ///
    /// # 参数
    ///
    /// * `capacity` - 槽位数，至少为 2
    ///
    /// # 示例
    ///
    /// ```ignore
    /// let ring = RingBuffer::new(180);
    /// assert_eq!(ring.last_written_sequence(), 0);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            state: Mutex::new(RingState {
                slots: vec![None; capacity],
                write_index: None,
                last_sequence: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 追加一个包，返回分配的序列号
    pub fn append(&self, packet: EncodedPacket, meta: SlotMeta) -> u64 {
        let mut state = self.state.lock();
        let index = match state.write_index {
            Some(current) => self.next_index(current),
            None => 0,
        };
        state.last_sequence += 1;
        let sequence = state.last_sequence;
        state.slots[index] = Some(PacketSlot {
            sequence,
            packet,
            time_base: meta.time_base,
            epoch: meta.epoch,
            epoch_start_pts: meta.epoch_start_pts,
        });
        state.write_index = Some(index);
        sequence
    }

    /// 读取指定槽位
    ///
    /// 仅当槽位中的序列号大于 `after_sequence` 时返回，否则视为未就绪。
    pub fn read_at(&self, index: usize, after_sequence: u64) -> Option<PacketSlot> {
        let state = self.state.lock();
        match state.slots.get(index) {
            Some(Some(slot)) if slot.sequence > after_sequence => Some(slot.clone()),
            _ => None,
        }
    }

    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.capacity
    }

    pub fn prev_index(&self, index: usize) -> usize {
        (index + self.capacity - 1) % self.capacity
    }

    /// 最近一次写入的槽位下标，尚未写入时为 `None`
    pub fn current_write_index(&self) -> Option<usize> {
        self.state.lock().write_index
    }

    /// 最近一次写入的序列号，尚未写入时为 0
    pub fn last_written_sequence(&self) -> u64 {
        self.state.lock().last_sequence
    }

    /// 一次性读取写游标与序列号
    fn snapshot(&self) -> (Option<usize>, u64) {
        let state = self.state.lock();
        (state.write_index, state.last_sequence)
    }

    /// 仍保留的最旧槽位下标
    fn oldest_index(&self, write_index: usize, last_sequence: u64) -> usize {
        if last_sequence <= self.capacity as u64 {
            0
        } else {
            self.next_index(write_index)
        }
    }

    /// 轮询等待写游标越过 `observed_sequence`
    ///
    /// 每隔 `interval` 检查一次，最多 `max_polls` 次；取消令牌触发时立即返回。
    pub async fn wait_for_write_advance(
        &self,
        observed_sequence: u64,
        interval: Duration,
        max_polls: u32,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        for _ in 0..max_polls {
            if self.last_written_sequence() > observed_sequence {
                return WaitOutcome::Advanced;
            }
            tokio::select! {
                _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        if self.last_written_sequence() > observed_sequence {
            WaitOutcome::Advanced
        } else {
            WaitOutcome::Exhausted
        }
    }
}

/// 等待写游标前进的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Advanced,
    /// 轮询次数用尽
    Exhausted,
    Cancelled,
}

/// 读游标单次读取结果
#[derive(Debug, Clone)]
pub enum CursorRead {
    /// 顺序读取到下一个包
    Ready(PacketSlot),
    /// 读者被覆盖，已跳转到最旧的有效槽位
    Resynced { slot: PacketSlot, skipped: u64 },
    /// 已追上写者
    Pending,
}

/// 客户端读游标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCursor {
    index: usize,
    last_sequence: u64,
}

impl ReadCursor {
    /// 计算迟到读者的起始位置
    ///
    /// 取最旧有效槽位与写游标之间的中点，使客户端背后留有足够的历史内容，
    /// 又不至于从队尾（可能处于 GOP 中间）开始。
    pub fn starting_point(ring: &RingBuffer) -> Self {
        let (write_index, last_sequence) = ring.snapshot();
        let Some(write_index) = write_index else {
            return Self {
                index: 0,
                last_sequence: 0,
            };
        };

        let capacity = ring.capacity();
        let oldest = ring.oldest_index(write_index, last_sequence);
        let span = (write_index + capacity - oldest) % capacity;
        let index = (oldest + span / 2) % capacity;
        let behind = ((write_index + capacity - index) % capacity) as u64;
        let slot_sequence = last_sequence - behind;

        Self {
            index,
            last_sequence: slot_sequence - 1,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// 读取下一个包
    pub fn poll(&mut self, ring: &RingBuffer) -> CursorRead {
        let (write_index, latest) = ring.snapshot();
        let Some(write_index) = write_index else {
            return CursorRead::Pending;
        };

        if latest.saturating_sub(self.last_sequence) > ring.capacity() as u64 {
            let oldest = ring.oldest_index(write_index, latest);
            if let Some(slot) = ring.read_at(oldest, 0) {
                let skipped = slot.sequence - self.last_sequence - 1;
                debug!(
                    "Reader overrun: jumping from seq {} to seq {} ({} skipped)",
                    self.last_sequence, slot.sequence, skipped
                );
                self.accept(ring, oldest, &slot);
                return CursorRead::Resynced { slot, skipped };
            }
            return CursorRead::Pending;
        }

        match ring.read_at(self.index, self.last_sequence) {
            Some(slot) => {
                self.accept(ring, self.index, &slot);
                CursorRead::Ready(slot)
            }
            None => CursorRead::Pending,
        }
    }

    fn accept(&mut self, ring: &RingBuffer, index: usize, slot: &PacketSlot) {
        self.last_sequence = slot.sequence;
        self.index = ring.next_index(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::MediaKind;

    fn meta() -> SlotMeta {
        SlotMeta {
            time_base: Rational::MPEG_CLOCK,
            epoch: 1,
            epoch_start_pts: 0,
        }
    }

    fn packet(pts: i64) -> EncodedPacket {
        EncodedPacket::new(MediaKind::Video, pts, pts, pts % 10 == 0, Bytes::from_static(b"x"))
    }

    fn fill(ring: &RingBuffer, count: u64) {
        let start = ring.last_written_sequence();
        for i in 0..count {
            ring.append(packet((start + i + 1) as i64), meta());
        }
    }

    #[test]
    fn test_sequence_increments_by_one() {
        let ring = RingBuffer::new(8);
        let mut previous = ring.last_written_sequence();
        for i in 0..50 {
            let seq = ring.append(packet(i), meta());
            assert_eq!(seq, previous + 1);
            assert_eq!(ring.last_written_sequence(), previous + 1);
            previous = seq;
        }
    }

    #[test]
    fn test_write_index_wraps() {
        let ring = RingBuffer::new(4);
        assert_eq!(ring.current_write_index(), None);
        fill(&ring, 1);
        assert_eq!(ring.current_write_index(), Some(0));
        fill(&ring, 4);
        assert_eq!(ring.current_write_index(), Some(0));
        assert_eq!(ring.read_at(0, 0).unwrap().sequence, 5);
    }

    #[test]
    fn test_index_arithmetic() {
        let ring = RingBuffer::new(180);
        assert_eq!(ring.next_index(179), 0);
        assert_eq!(ring.prev_index(0), 179);
        assert_eq!(ring.prev_index(ring.next_index(42)), 42);
    }

    #[test]
    fn test_read_at_not_ready() {
        let ring = RingBuffer::new(4);
        assert!(ring.read_at(0, 0).is_none());
        fill(&ring, 1);
        assert!(ring.read_at(0, 0).is_some());
        assert!(ring.read_at(0, 1).is_none());
        assert!(ring.read_at(1, 0).is_none());
    }

    #[test]
    fn test_cursor_reads_in_order_then_waits() {
        let ring = RingBuffer::new(16);
        let mut cursor = ReadCursor::starting_point(&ring);
        assert!(matches!(cursor.poll(&ring), CursorRead::Pending));

        fill(&ring, 3);
        for expected in 1..=3 {
            match cursor.poll(&ring) {
                CursorRead::Ready(slot) => assert_eq!(slot.sequence, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(matches!(cursor.poll(&ring), CursorRead::Pending));
    }

    #[test]
    fn test_starting_point_is_midpoint() {
        let ring = RingBuffer::new(180);
        fill(&ring, 100);
        let cursor = ReadCursor::starting_point(&ring);
        assert_eq!(cursor.index(), 49);
        assert_eq!(cursor.last_sequence(), 49);

        fill(&ring, 200);
        // 写游标 119，最旧槽位 120，中点在两者之间
        let cursor = ReadCursor::starting_point(&ring);
        let mut cursor_copy = cursor;
        match cursor_copy.poll(&ring) {
            CursorRead::Ready(slot) => {
                assert_eq!(slot.sequence, cursor.last_sequence() + 1);
                assert!(slot.sequence > 300 - 180);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_overrun_reader_resyncs_to_oldest() {
        let ring = RingBuffer::new(180);
        fill(&ring, 100);
        let mut cursor = ReadCursor::starting_point(&ring);
        assert_eq!(cursor.index(), ring.current_write_index().unwrap() / 2);

        fill(&ring, 200);
        match cursor.poll(&ring) {
            CursorRead::Resynced { slot, skipped } => {
                assert_eq!(slot.sequence, 121);
                assert_eq!(skipped, 121 - 49 - 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        match cursor.poll(&ring) {
            CursorRead::Ready(slot) => assert_eq!(slot.sequence, 122),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_overrun_from_empty_start() {
        let ring = RingBuffer::new(180);
        let mut cursor = ReadCursor::starting_point(&ring);
        fill(&ring, 200);
        match cursor.poll(&ring) {
            CursorRead::Resynced { slot, .. } => {
                assert_eq!(slot.sequence, 21);
                assert_eq!(cursor.index(), 21);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reader_exactly_one_lap_behind_still_reads() {
        let ring = RingBuffer::new(10);
        let mut cursor = ReadCursor::starting_point(&ring);
        fill(&ring, 10);
        match cursor.poll(&ring) {
            CursorRead::Ready(slot) => assert_eq!(slot.sequence, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_for_write_advance() {
        let ring = std::sync::Arc::new(RingBuffer::new(8));
        let cancel = CancellationToken::new();

        let outcome = ring
            .wait_for_write_advance(0, Duration::from_millis(1), 3, &cancel)
            .await;
        assert_eq!(outcome, WaitOutcome::Exhausted);

        let writer = ring.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            fill(&writer, 1);
        });
        let outcome = ring
            .wait_for_write_advance(0, Duration::from_millis(2), 1000, &cancel)
            .await;
        assert_eq!(outcome, WaitOutcome::Advanced);

        cancel.cancel();
        let outcome = ring
            .wait_for_write_advance(1, Duration::from_millis(2), 1000, &cancel)
            .await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }
}
