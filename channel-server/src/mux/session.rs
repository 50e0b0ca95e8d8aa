// 统一低延迟视频流传输系统 - 客户端复用会话
//
// 每个 HTTP 连接对应一个会话：
//
// OPENING -> STREAMING -> (每个包: WAIT_FOR_DATA <-> EMIT) -> CLOSED
//
// 会话只重新描述容器参数，不重新编码媒体数据。

use crate::buffer::{CursorRead, PacketSlot, ReadCursor, WaitOutcome};
use crate::channel::ChannelShared;
use crate::codec::OutputLayout;
use crate::config::SessionConfig;
use crate::error::{BackoffPolicy, SessionError};
use crate::mux::timeline::{RebaseOutcome, SessionTimeline};
use crate::mux::ts_muxer::TsMuxer;
use bytes::{Bytes, BytesMut};
use common::{EncodedPacket, MediaKind, Rational};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 一次拉取的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    Data(Bytes),
    /// 会话结束（频道关闭或故障）
    End,
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Streaming,
    WaitForData,
    Emit,
    Closed,
}

/// 会话统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets_emitted: u64,
    /// 关键帧到来之前被跳过的包
    pub packets_gated: u64,
    /// 时间戳为负被丢弃的视频包
    pub packets_dropped: u64,
    pub resyncs: u64,
    pub bytes_delivered: u64,
}

/// 客户端计数租约，释放时减少频道的活动客户端数
struct ClientLease {
    channel: Arc<ChannelShared>,
}

impl ClientLease {
    fn acquire(channel: Arc<ChannelShared>) -> Self {
        channel.client_connected();
        Self { channel }
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        self.channel.client_disconnected();
    }
}

/// 首帧关键帧门控
#[derive(Debug, Clone, Copy)]
struct KeyframeGate {
    anchor: MediaKind,
    open: bool,
}

impl KeyframeGate {
    fn new(layout: &OutputLayout) -> Self {
        let anchor = if layout.video.is_some() {
            MediaKind::Video
        } else {
            MediaKind::Audio
        };
        Self {
            anchor,
            open: false,
        }
    }

    fn admit(&mut self, packet: &EncodedPacket) -> bool {
        if !self.open && packet.kind == self.anchor && packet.is_keyframe {
            self.open = true;
        }
        self.open
    }
}

/// 内存字节缓冲，HTTP 层从头部取走数据，读空后为空缓冲
#[derive(Debug, Default)]
struct ByteSink {
    buf: BytesMut,
}

impl ByteSink {
    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, max: usize) -> Bytes {
        let n = max.max(1).min(self.buf.len());
        self.buf.split_to(n).freeze()
    }
}

/// 客户端复用会话
pub struct ClientSession {
    id: Uuid,
    channel: Arc<ChannelShared>,
    _lease: ClientLease,
    layout: OutputLayout,
    cursor: ReadCursor,
    timeline: SessionTimeline,
    muxer: TsMuxer,
    sink: ByteSink,
    state: SessionState,
    gate: KeyframeGate,
    base_interval: Duration,
    poll_interval: Duration,
    max_polls: u32,
    policy: BackoffPolicy,
    starvation_rounds: u32,
    stats: SessionStats,
    cancel: CancellationToken,
}

impl ClientSession {
    /// 在已产生输出的频道上打开会话
    ///
    /// # 参数
    ///
    /// * `channel` - 频道共享状态
    /// * `config` - 会话轮询配置
    ///
    /// # 返回
    ///
    /// 频道故障返回 `ChannelFaulted`，尚无输出布局返回 `NotReady`
    pub fn open(channel: Arc<ChannelShared>, config: &SessionConfig) -> Result<Self, SessionError> {
        let number = channel.number();
        if channel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        if channel.is_faulted() {
            return Err(SessionError::ChannelFaulted(number));
        }
        let layout = channel.layout().ok_or(SessionError::NotReady(number))?;

        let id = Uuid::new_v4();
        debug!("ch{}: session {} opening", number, id);

        let mut muxer = TsMuxer::new(&layout);
        let mut sink = ByteSink::default();
        muxer.write_header(&mut sink.buf);

        let cursor = ReadCursor::starting_point(channel.ring());
        let cancel = channel.cancel_token().child_token();
        let lease = ClientLease::acquire(channel.clone());
        let base_interval = config.poll_interval();

        info!(
            "ch{}: session {} streaming from seq {} (slot {})",
            number,
            id,
            cursor.last_sequence() + 1,
            cursor.index()
        );

        Ok(Self {
            id,
            channel,
            _lease: lease,
            layout,
            cursor,
            timeline: SessionTimeline::new(Rational::MPEG_CLOCK, Rational::MPEG_CLOCK),
            muxer,
            sink,
            state: SessionState::Streaming,
            gate: KeyframeGate::new(&layout),
            base_interval,
            poll_interval: base_interval,
            max_polls: config.max_polls.max(1),
            policy: config.starvation_policy(),
            starvation_rounds: 0,
            stats: SessionStats::default(),
            cancel,
        })
    }

    /// 等待频道产生输出后打开会话
    pub async fn connect(
        channel: Arc<ChannelShared>,
        config: &SessionConfig,
        ready_timeout: Duration,
    ) -> Result<Self, SessionError> {
        if channel.is_faulted() {
            return Err(SessionError::ChannelFaulted(channel.number()));
        }
        channel.wait_for_output(ready_timeout).await?;
        Self::open(channel, config)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// 结束会话
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.cancel.cancel();
        self.sink = ByteSink::default();
        info!(
            "ch{}: session {} closed ({} packets, {} bytes, {} resyncs)",
            self.channel.number(),
            self.id,
            self.stats.packets_emitted,
            self.stats.bytes_delivered,
            self.stats.resyncs
        );
    }

    /// 拉取最多 `max` 字节的输出
    ///
    /// 缓冲中有数据时立即返回；否则从环形缓冲区读取并复用下一个包，
    /// 追上写者时按轮询间隔等待。
    pub async fn pull(&mut self, max: usize) -> Result<Pull, SessionError> {
        loop {
            if self.state == SessionState::Closed {
                return Ok(Pull::End);
            }

            if !self.sink.is_empty() {
                let chunk = self.sink.take(max);
                self.stats.bytes_delivered += chunk.len() as u64;
                return Ok(Pull::Data(chunk));
            }

            if self.cancel.is_cancelled() {
                self.close();
                return Ok(Pull::End);
            }

            match self.cursor.poll(self.channel.ring()) {
                CursorRead::Ready(slot) => {
                    self.reset_starvation();
                    self.emit(&slot);
                }
                CursorRead::Resynced { slot, skipped } => {
                    warn!(
                        "ch{}: session {} fell behind, skipped {} packets",
                        self.channel.number(),
                        self.id,
                        skipped
                    );
                    self.stats.resyncs += 1;
                    self.reset_starvation();
                    self.emit(&slot);
                }
                CursorRead::Pending => self.wait_for_data().await,
            }
        }
    }

    async fn wait_for_data(&mut self) {
        self.state = SessionState::WaitForData;
        let outcome = self
            .channel
            .ring()
            .wait_for_write_advance(
                self.cursor.last_sequence(),
                self.poll_interval,
                self.max_polls,
                &self.cancel,
            )
            .await;

        match outcome {
            WaitOutcome::Advanced => {}
            WaitOutcome::Cancelled => self.close(),
            WaitOutcome::Exhausted => {
                self.starvation_rounds = self.starvation_rounds.saturating_add(1);
                self.poll_interval = self
                    .policy
                    .calculate_delay(self.starvation_rounds)
                    .max(self.base_interval);
                warn!(
                    "ch{}: Excessive wait for new packet (session {}, round {}, polling every {:?})",
                    self.channel.number(),
                    self.id,
                    self.starvation_rounds,
                    self.poll_interval
                );
                if self.channel.is_faulted() {
                    self.close();
                }
            }
        }
    }

    fn reset_starvation(&mut self) {
        if self.starvation_rounds > 0 {
            debug!(
                "ch{}: session {} data resumed after {} starved rounds",
                self.channel.number(),
                self.id,
                self.starvation_rounds
            );
        }
        self.starvation_rounds = 0;
        self.poll_interval = self.base_interval;
    }

    fn carries(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.layout.video.is_some(),
            MediaKind::Audio => self.layout.audio.is_some(),
        }
    }

    fn emit(&mut self, slot: &PacketSlot) {
        self.state = SessionState::Emit;
        let packet = &slot.packet;

        if !self.carries(packet.kind) {
            self.state = SessionState::Streaming;
            return;
        }
        if !self.gate.admit(packet) {
            self.stats.packets_gated += 1;
            self.state = SessionState::Streaming;
            return;
        }

        match self.timeline.rebase(slot) {
            RebaseOutcome::Drop { raw_pts } => {
                self.stats.packets_dropped += 1;
                debug!(
                    "ch{}: session {} dropped {} packet seq {} with negative pts {}",
                    self.channel.number(),
                    self.id,
                    packet.kind,
                    slot.sequence,
                    raw_pts
                );
            }
            RebaseOutcome::Emit(rebased) => {
                let out = EncodedPacket {
                    pts: rebased.pts,
                    dts: rebased.dts,
                    duration: rebased.duration,
                    ..packet.clone()
                };
                self.muxer.write_packet(&out, &mut self.sink.buf);
                self.stats.packets_emitted += 1;
            }
        }
        self.state = SessionState::Streaming;
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}
