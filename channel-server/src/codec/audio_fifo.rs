// 统一低延迟视频流传输系统 - 音频采样 FIFO
//
// 当输入音频的原生帧大小与输出编码器要求的帧大小不一致时，
// 解码后的采样先进入 FIFO，再按编码器帧大小重新切分。

use super::{CodecError, Frame, FrameData};
use common::{rescale, MediaKind, Rational};
use std::collections::VecDeque;

/// 平面采样 FIFO
pub struct AudioFifo {
    planes: Vec<VecDeque<f32>>,
    sample_rate: u32,
    time_base: Rational,
    /// 锚点：FIFO 由空变为非空时第一个采样的时间戳
    anchor_pts: Option<i64>,
    /// 自锚点以来已取出的采样数
    drained_since_anchor: i64,
}

impl AudioFifo {
    /// 创建 FIFO
    ///
    /// # 参数
    ///
    /// * `channels` - 输出声道数
    /// * `sample_rate` - 采样率
    /// * `time_base` - 输出帧时间戳的时间基
    pub fn new(channels: u16, sample_rate: u32, time_base: Rational) -> Self {
        Self {
            planes: vec![VecDeque::new(); channels.max(1) as usize],
            sample_rate,
            time_base,
            anchor_pts: None,
            drained_since_anchor: 0,
        }
    }

    /// 缓冲中的采样数
    pub fn len(&self) -> usize {
        self.planes.first().map(|plane| plane.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空缓冲（新文件开始时调用）
    pub fn reset(&mut self) {
        for plane in &mut self.planes {
            plane.clear();
        }
        self.anchor_pts = None;
        self.drained_since_anchor = 0;
    }

    /// 写入一帧解码后的采样
    ///
    /// 声道数不一致时多余声道被丢弃，缺少的声道复制第一声道。
    pub fn write(&mut self, frame: &Frame) -> Result<(), CodecError> {
        let FrameData::Samples(input) = &frame.data else {
            return Err(CodecError::Unsupported(
                "audio fifo requires decoded samples".into(),
            ));
        };
        let Some(first) = input.first() else {
            return Ok(());
        };

        if self.is_empty() {
            if let Some(pts) = frame.pts {
                self.anchor_pts = Some(pts);
                self.drained_since_anchor = 0;
            }
        }

        let samples = frame.nb_samples.min(first.len());
        for (channel, plane) in self.planes.iter_mut().enumerate() {
            let source = input.get(channel).unwrap_or(first);
            plane.extend(source.iter().take(samples).copied());
        }
        Ok(())
    }

    /// 取出恰好 `frame_size` 个采样组成的一帧，不足时返回 `None`
    pub fn read_frame(&mut self, frame_size: usize) -> Option<Frame> {
        if frame_size == 0 || self.len() < frame_size {
            return None;
        }

        let planes: Vec<Vec<f32>> = self
            .planes
            .iter_mut()
            .map(|plane| plane.drain(..frame_size).collect())
            .collect();

        let sample_tb = Rational::per_second(self.sample_rate);
        let pts = self
            .anchor_pts
            .map(|anchor| anchor + rescale(self.drained_since_anchor, sample_tb, self.time_base));
        self.drained_since_anchor += frame_size as i64;

        Some(Frame {
            kind: MediaKind::Audio,
            pts,
            dts: pts,
            duration: rescale(frame_size as i64, sample_tb, self.time_base),
            is_keyframe: true,
            nb_samples: frame_size,
            data: FrameData::Samples(planes),
        })
    }
}
