// 统一低延迟视频流传输系统 - 实时节奏控制
//
// 让文件代开始以来经过的墙钟时间追上视频时间戳的增量。差距超过失步阈值时
// 不做长时间等待，而是把锚点重置到当前包。

use common::{rescale, Rational};
use std::time::{Duration, Instant};
use tracing::debug;

/// 单包节奏决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceDecision {
    /// 已赶上或落后，立即处理
    Proceed,
    /// 需要睡眠这么久
    Sleep(Duration),
    /// 差距过大，锚点已重置
    Reanchored,
}

/// 实时节奏控制器（只跟踪视频流）
#[derive(Debug, Clone)]
pub struct RealtimePacer {
    time_base: Rational,
    resync_threshold: Duration,
    anchor: Option<(Instant, i64)>,
    last_pts: Option<i64>,
}

impl RealtimePacer {
    /// 创建节奏控制器
    ///
    /// # 参数
    ///
    /// * `time_base` - 视频时间戳的时间基
    /// * `resync_threshold` - 超过该差距视为失步
    pub fn new(time_base: Rational, resync_threshold: Duration) -> Self {
        Self {
            time_base,
            resync_threshold,
            anchor: None,
            last_pts: None,
        }
    }

    /// 以当前时刻和给定时间戳作为新的锚点
    pub fn anchor(&mut self, now: Instant, pts: i64) {
        self.anchor = Some((now, pts));
        self.last_pts = Some(pts);
    }

    /// 清除锚点，下一个包重新锚定
    pub fn reset(&mut self) {
        self.anchor = None;
        self.last_pts = None;
    }

    /// 计算一个视频包的节奏决定
    ///
    /// 时间戳倒退的包不参与节奏控制。
    pub fn pace(&mut self, pts: i64, now: Instant) -> PaceDecision {
        let Some((start_time, start_pts)) = self.anchor else {
            self.anchor(now, pts);
            return PaceDecision::Proceed;
        };
        if self.last_pts.is_some_and(|last| pts < last) {
            return PaceDecision::Proceed;
        }
        self.last_pts = Some(pts);

        let media_us = rescale(pts - start_pts, self.time_base, Rational::MICROS);
        let wall_us = now.saturating_duration_since(start_time).as_micros() as i64;
        let ahead_us = media_us - wall_us;
        if ahead_us <= 0 {
            return PaceDecision::Proceed;
        }

        let ahead = Duration::from_micros(ahead_us as u64);
        if ahead < self.resync_threshold {
            PaceDecision::Sleep(ahead)
        } else {
            debug!(
                "Pacer desync: {:?} ahead of wall clock, re-anchoring at pts {}",
                ahead, pts
            );
            self.anchor(now, pts);
            PaceDecision::Reanchored
        }
    }
}
