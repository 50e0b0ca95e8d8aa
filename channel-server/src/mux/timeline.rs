// 统一低延迟视频流传输系统 - 时间线重定基
//
// 环形缓冲区中的包带有频道全局的时间戳（按文件代划分）。每个客户端会话
// 把它们换算到自己私有的、从零开始且连续的输出时间线上：
//
// 1. 换算到输出时间基，减去该代的起始时间戳，加上本流的基准偏移
// 2. 文件代变化时，基准偏移重算为 上次输出值 + 本流起点，新文件紧接上一文件
// 3. 不大于上次输出值时加一个刻度，保证严格递增
// 4. 两路流首次建立起点时互相对齐，取较早者作为共同零点
// 5. 非正值钳制为 1；视频在钳制前为负时丢弃该包

use crate::buffer::PacketSlot;
use common::{rescale, MediaKind, Rational};
use tracing::debug;

/// 重定基后的时间戳（输出时间基）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rebased {
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
}

/// 单包重定基结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseOutcome {
    Emit(Rebased),
    /// 视频时间戳为负，丢弃
    Drop { raw_pts: i64 },
}

/// 单路流的重定基状态
#[derive(Debug, Clone)]
pub struct StreamTimeline {
    time_base: Rational,
    /// 首个包相对其代起点的偏移（输出时间基）
    start_point: Option<i64>,
    last_pts: i64,
    last_dts: i64,
    base_offset: i64,
    epoch: Option<u64>,
}

impl StreamTimeline {
    pub fn new(time_base: Rational) -> Self {
        Self {
            time_base,
            start_point: None,
            last_pts: 0,
            last_dts: 0,
            base_offset: 0,
            epoch: None,
        }
    }

    pub fn start_point(&self) -> Option<i64> {
        self.start_point
    }

    /// 槽位时间戳相对其代起点的偏移（输出时间基）
    fn relative(&self, value: i64, slot: &PacketSlot) -> i64 {
        rescale(value - slot.epoch_start_pts, slot.time_base, self.time_base)
    }

    fn rebase(&mut self, slot: &PacketSlot, drop_negative: bool) -> RebaseOutcome {
        let start = self.start_point.unwrap_or(0);

        if self.epoch != Some(slot.epoch) {
            if self.epoch.is_some() {
                self.base_offset = self.last_pts + start;
                debug!(
                    "{} timeline: epoch {:?} -> {}, base offset {}",
                    slot.packet.kind, self.epoch, slot.epoch, self.base_offset
                );
            }
            self.epoch = Some(slot.epoch);
        }

        let raw_pts = self.relative(slot.packet.pts, slot) - start + self.base_offset;
        if raw_pts < 0 && drop_negative {
            return RebaseOutcome::Drop { raw_pts };
        }

        let mut pts = raw_pts.max(1);
        if pts <= self.last_pts {
            pts = self.last_pts + 1;
        }

        let raw_dts = self.relative(slot.packet.dts, slot) - start + self.base_offset;
        let mut dts = raw_dts.max(1);
        if dts <= self.last_dts {
            dts = self.last_dts + 1;
        }
        dts = dts.min(pts);

        self.last_pts = pts;
        self.last_dts = dts;

        RebaseOutcome::Emit(Rebased {
            pts,
            dts,
            duration: rescale(slot.packet.duration, slot.time_base, self.time_base),
        })
    }
}

/// 会话级时间线（视频 + 音频）
#[derive(Debug, Clone)]
pub struct SessionTimeline {
    video: StreamTimeline,
    audio: StreamTimeline,
}

impl SessionTimeline {
    pub fn new(video_time_base: Rational, audio_time_base: Rational) -> Self {
        Self {
            video: StreamTimeline::new(video_time_base),
            audio: StreamTimeline::new(audio_time_base),
        }
    }

    pub fn stream(&self, kind: MediaKind) -> &StreamTimeline {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    fn split_mut(&mut self, kind: MediaKind) -> (&mut StreamTimeline, &mut StreamTimeline) {
        match kind {
            MediaKind::Video => (&mut self.video, &mut self.audio),
            MediaKind::Audio => (&mut self.audio, &mut self.video),
        }
    }

    /// 把槽位时间戳换算到会话输出时间线
    pub fn rebase(&mut self, slot: &PacketSlot) -> RebaseOutcome {
        let kind = slot.packet.kind;
        let (this, other) = self.split_mut(kind);

        if this.start_point.is_none() {
            let mut start = this.relative(slot.packet.pts, slot);
            if let Some(other_start) = other.start_point {
                let converted = rescale(other_start, other.time_base, this.time_base);
                if converted < start {
                    start = converted;
                } else {
                    other.start_point = Some(rescale(start, this.time_base, other.time_base));
                }
            }
            debug!("{} timeline: start point {}", kind, start);
            this.start_point = Some(start);
            this.epoch = Some(slot.epoch);
        }

        this.rebase(slot, kind == MediaKind::Video)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::EncodedPacket;

    const MS: Rational = Rational::new(1, 1000);

    fn slot(kind: MediaKind, pts: i64, epoch: u64, epoch_start: i64) -> PacketSlot {
        slot_with_dts(kind, pts, pts, epoch, epoch_start)
    }

    fn slot_with_dts(kind: MediaKind, pts: i64, dts: i64, epoch: u64, epoch_start: i64) -> PacketSlot {
        PacketSlot {
            sequence: 0,
            packet: EncodedPacket::new(kind, pts, dts, false, Bytes::new()).with_duration(40),
            time_base: MS,
            epoch,
            epoch_start_pts: epoch_start,
        }
    }

    fn emitted(outcome: RebaseOutcome) -> Rebased {
        match outcome {
            RebaseOutcome::Emit(rebased) => rebased,
            RebaseOutcome::Drop { raw_pts } => panic!("dropped {}", raw_pts),
        }
    }

    #[test]
    fn test_session_starts_near_zero() {
        let mut timeline = SessionTimeline::new(Rational::MPEG_CLOCK, Rational::MPEG_CLOCK);
        // 会话在文件播放 30 秒时加入
        let first = emitted(timeline.rebase(&slot(MediaKind::Video, 30_100, 1, 100)));
        assert_eq!(first.pts, 1);
        assert_eq!(first.duration, 3600);
        let second = emitted(timeline.rebase(&slot(MediaKind::Video, 30_140, 1, 100)));
        assert_eq!(second.pts, 3600);
    }

    #[test]
    fn test_strictly_increasing_across_epochs() {
        let mut timeline = SessionTimeline::new(Rational::MPEG_CLOCK, Rational::MPEG_CLOCK);
        let mut last = 0;
        let mut check = |outcome: RebaseOutcome| {
            let rebased = emitted(outcome);
            assert!(rebased.pts > last, "{} <= {}", rebased.pts, last);
            last = rebased.pts;
        };

        for i in 0..50 {
            check(timeline.rebase(&slot(MediaKind::Video, 1000 + i * 40, 1, 1000)));
        }
        // 第二个文件从更小的时间戳开始
        for i in 0..50 {
            check(timeline.rebase(&slot(MediaKind::Video, i * 40, 2, 0)));
        }
        // 第三个文件：时间戳完全相同的重复
        for _ in 0..5 {
            check(timeline.rebase(&slot(MediaKind::Video, 500, 3, 500)));
        }
    }

    #[test]
    fn test_epoch_boundary_grafts_after_last() {
        let mut timeline = SessionTimeline::new(Rational::MPEG_CLOCK, Rational::MPEG_CLOCK);
        emitted(timeline.rebase(&slot(MediaKind::Audio, 10_000, 1, 0)));
        let before = emitted(timeline.rebase(&slot(MediaKind::Audio, 12_000, 1, 0)));

        let after = emitted(timeline.rebase(&slot(MediaKind::Audio, 700, 2, 700)));
        assert_eq!(after.pts, before.pts + 1);

        let later = emitted(timeline.rebase(&slot(MediaKind::Audio, 740, 2, 700)));
        assert_eq!(later.pts, before.pts + 3600);
    }

    #[test]
    fn test_negative_video_dropped_audio_clamped() {
        let mut timeline = SessionTimeline::new(Rational::MPEG_CLOCK, Rational::MPEG_CLOCK);
        emitted(timeline.rebase(&slot(MediaKind::Video, 5000, 1, 0)));
        // B 帧显示时间早于起点
        assert!(matches!(
            timeline.rebase(&slot(MediaKind::Video, 4900, 1, 0)),
            RebaseOutcome::Drop { .. }
        ));

        let mut audio_only = SessionTimeline::new(Rational::MPEG_CLOCK, Rational::MPEG_CLOCK);
        emitted(audio_only.rebase(&slot(MediaKind::Audio, 5000, 1, 0)));
        let clamped = emitted(audio_only.rebase(&slot(MediaKind::Audio, 4000, 1, 0)));
        assert_eq!(clamped.pts, 2);
    }

    #[test]
    fn test_cross_stream_alignment_uses_earlier_start() {
        let mut timeline = SessionTimeline::new(Rational::MPEG_CLOCK, Rational::per_second(48_000));
        emitted(timeline.rebase(&slot(MediaKind::Video, 2000, 1, 0)));
        assert_eq!(timeline.stream(MediaKind::Video).start_point(), Some(180_000));

        // 音频起点更早：两路都以音频为零点
        let audio = emitted(timeline.rebase(&slot(MediaKind::Audio, 1500, 1, 0)));
        assert_eq!(timeline.stream(MediaKind::Audio).start_point(), Some(72_000));
        assert_eq!(audio.pts, 1);

        let video = emitted(timeline.rebase(&slot(MediaKind::Video, 2040, 1, 0)));
        // 2.04s - 1.5s = 0.54s
        assert_eq!(video.pts, 48_600);
    }

    #[test]
    fn test_cross_stream_alignment_keeps_existing_earlier_start() {
        let mut timeline = SessionTimeline::new(Rational::MPEG_CLOCK, Rational::MPEG_CLOCK);
        emitted(timeline.rebase(&slot(MediaKind::Video, 1000, 1, 0)));
        emitted(timeline.rebase(&slot(MediaKind::Audio, 1200, 1, 0)));
        assert_eq!(timeline.stream(MediaKind::Audio).start_point(), Some(90_000));
        let audio = emitted(timeline.rebase(&slot(MediaKind::Audio, 1240, 1, 0)));
        assert_eq!(audio.pts, 21_600);
    }

    #[test]
    fn test_dts_never_exceeds_pts_and_increases() {
        let mut timeline = SessionTimeline::new(Rational::MPEG_CLOCK, Rational::MPEG_CLOCK);
        let a = emitted(timeline.rebase(&slot_with_dts(MediaKind::Video, 1080, 1000, 1, 1000)));
        let b = emitted(timeline.rebase(&slot_with_dts(MediaKind::Video, 1160, 1040, 1, 1000)));
        let c = emitted(timeline.rebase(&slot_with_dts(MediaKind::Video, 1120, 1080, 1, 1000)));
        for r in [a, b, c] {
            assert!(r.dts <= r.pts);
        }
        assert!(b.dts > a.dts);
        assert!(c.dts > b.dts);
    }
}
