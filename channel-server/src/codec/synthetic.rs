// 统一低延迟视频流传输系统 - 合成片源后端
//
// 播放列表中的文件内容是一段 TOML，描述要生成的片段（时长、帧率、GOP、
// 音频参数等）。解码器按描述生成帧，编码器模拟固定帧大小的 AC-3 音频
// 编码器和保留关键帧标志的视频编码器。
//
// # 示例
//
// ```toml
// duration_ms = 4000
// fps = 25
// gop = 25
// audio_frame_size = 1024
// ```

use super::{
    CodecError, Decoder, Encoder, EncoderSettings, Frame, FrameData, InputMedia, InputOptions,
    InputStream, MediaBackend, Packet, StreamParams, AC3_FRAME_SIZE,
};
use bytes::{BufMut, Bytes, BytesMut};
use common::{rescale, EncodedPacket, MediaKind, Rational};
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const CORRUPT_MARKER: &[u8] = b"corrupt";
const BROKEN_CODEC: &str = "broken";

/// 合成片段描述
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyntheticClip {
    pub duration_ms: u64,
    pub fps: u32,
    pub gop: u32,
    /// 容器起始时间偏移
    pub start_ms: i64,
    pub video: bool,
    pub audio: bool,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// 输入音频原生帧大小
    pub audio_frame_size: usize,
    /// 每隔 N 个视频包插入一个损坏包，0 表示不插入
    pub corrupt_every: u32,
    /// 音频流使用无法打开的解码器
    pub broken_audio_decoder: bool,
}

impl Default for SyntheticClip {
    fn default() -> Self {
        Self {
            duration_ms: 2000,
            fps: 25,
            gop: 12,
            start_ms: 100,
            video: true,
            audio: true,
            width: 640,
            height: 360,
            sample_rate: 48_000,
            channels: 2,
            audio_frame_size: 1024,
            corrupt_every: 0,
            broken_audio_decoder: false,
        }
    }
}

impl SyntheticClip {
    fn load(path: &Path) -> Result<Self, CodecError> {
        let open_error = |reason: String| CodecError::Open {
            path: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| open_error(e.to_string()))?;
        let clip: SyntheticClip = toml::from_str(&text).map_err(|e| open_error(e.to_string()))?;
        if !clip.video && !clip.audio {
            return Err(open_error("no media streams".into()));
        }
        if clip.fps == 0 || clip.sample_rate == 0 || clip.audio_frame_size == 0 {
            return Err(open_error("invalid stream parameters".into()));
        }
        Ok(clip)
    }

    fn video_time_base() -> Rational {
        Rational::new(1, 1000)
    }

    fn audio_time_base(&self) -> Rational {
        Rational::per_second(self.sample_rate)
    }

    fn video_frames(&self) -> u64 {
        self.duration_ms * self.fps as u64 / 1000
    }

    fn audio_frames(&self) -> u64 {
        let samples = self.duration_ms * self.sample_rate as u64 / 1000;
        samples.div_ceil(self.audio_frame_size as u64)
    }

    fn streams(&self) -> Vec<InputStream> {
        let mut streams = Vec::new();
        if self.video {
            streams.push(InputStream {
                index: streams.len(),
                kind: MediaKind::Video,
                codec_name: "synthetic-video".into(),
                time_base: Self::video_time_base(),
                params: StreamParams::Video {
                    width: self.width,
                    height: self.height,
                    frame_rate: Rational::new(self.fps as i32, 1),
                },
            });
        }
        if self.audio {
            streams.push(InputStream {
                index: streams.len(),
                kind: MediaKind::Audio,
                codec_name: if self.broken_audio_decoder {
                    BROKEN_CODEC.into()
                } else {
                    "synthetic-audio".into()
                },
                time_base: self.audio_time_base(),
                params: StreamParams::Audio {
                    sample_rate: self.sample_rate,
                    channels: self.channels,
                    frame_size: self.audio_frame_size,
                },
            });
        }
        streams
    }
}

/// 合成后端
#[derive(Debug, Clone, Default)]
pub struct SyntheticBackend {
    fail_encoders: bool,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 所有编码器打开失败的后端
    #[cfg(test)]
    pub fn with_failing_encoders() -> Self {
        Self {
            fail_encoders: true,
        }
    }
}

impl MediaBackend for SyntheticBackend {
    fn open_input(
        &self,
        path: &Path,
        _options: &InputOptions,
    ) -> Result<Box<dyn InputMedia>, CodecError> {
        let clip = SyntheticClip::load(path)?;
        debug!("Opened synthetic clip {:?}: {:?}", path, clip);
        Ok(Box::new(SyntheticInput::new(clip)))
    }

    fn open_decoder(&self, stream: &InputStream) -> Result<Box<dyn Decoder>, CodecError> {
        if stream.codec_name == BROKEN_CODEC {
            return Err(CodecError::Unsupported(format!(
                "no decoder for {}",
                stream.codec_name
            )));
        }
        let (channels, frame_size) = match stream.params {
            StreamParams::Audio {
                channels,
                frame_size,
                ..
            } => (channels as usize, frame_size),
            StreamParams::Video { .. } => (0, 0),
        };
        Ok(Box::new(SyntheticDecoder {
            kind: stream.kind,
            channels,
            frame_size,
            queue: VecDeque::new(),
            flushing: false,
        }))
    }

    fn open_encoder(&self, settings: &EncoderSettings) -> Result<Box<dyn Encoder>, CodecError> {
        if self.fail_encoders {
            return Err(CodecError::Failed(format!(
                "cannot open {} encoder",
                settings.kind
            )));
        }
        let (time_base, frame_size) = match settings.source {
            StreamParams::Video { .. } => (settings.source_time_base, 0),
            StreamParams::Audio { sample_rate, .. } => {
                (Rational::per_second(sample_rate), AC3_FRAME_SIZE)
            }
        };
        Ok(Box::new(SyntheticEncoder {
            kind: settings.kind,
            time_base,
            frame_size,
            queue: VecDeque::new(),
            flushing: false,
        }))
    }

    fn probe_duration(&self, path: &Path) -> Option<Duration> {
        SyntheticClip::load(path)
            .ok()
            .map(|clip| Duration::from_millis(clip.duration_ms))
    }
}

struct SyntheticInput {
    streams: Vec<InputStream>,
    clip: SyntheticClip,
    next_video: u64,
    next_audio: u64,
}

impl SyntheticInput {
    fn new(clip: SyntheticClip) -> Self {
        Self {
            streams: clip.streams(),
            clip,
            next_video: 0,
            next_audio: 0,
        }
    }

    fn stream_index(&self, kind: MediaKind) -> usize {
        self.streams
            .iter()
            .position(|stream| stream.kind == kind)
            .unwrap_or(0)
    }

    fn video_pts(&self, frame: u64) -> i64 {
        self.clip.start_ms
            + rescale(
                frame as i64,
                Rational::new(1, self.clip.fps as i32),
                SyntheticClip::video_time_base(),
            )
    }

    fn audio_pts(&self, frame: u64) -> i64 {
        rescale(
            self.clip.start_ms,
            SyntheticClip::video_time_base(),
            self.clip.audio_time_base(),
        ) + (frame * self.clip.audio_frame_size as u64) as i64
    }

    fn next_video_packet(&mut self) -> Packet {
        let frame = self.next_video;
        self.next_video += 1;
        let pts = self.video_pts(frame);
        let corrupt = self.clip.corrupt_every > 0
            && frame > 0
            && frame % self.clip.corrupt_every as u64 == 0;
        let data = if corrupt {
            Bytes::from_static(CORRUPT_MARKER)
        } else {
            Bytes::copy_from_slice(&frame.to_be_bytes())
        };
        Packet {
            stream_index: self.stream_index(MediaKind::Video),
            pts: Some(pts),
            dts: Some(pts),
            duration: self.video_pts(frame + 1) - pts,
            is_keyframe: frame % self.clip.gop.max(1) as u64 == 0,
            data,
        }
    }

    fn next_audio_packet(&mut self) -> Packet {
        let frame = self.next_audio;
        self.next_audio += 1;
        let pts = self.audio_pts(frame);
        Packet {
            stream_index: self.stream_index(MediaKind::Audio),
            pts: Some(pts),
            dts: Some(pts),
            duration: self.clip.audio_frame_size as i64,
            is_keyframe: true,
            data: Bytes::copy_from_slice(&frame.to_be_bytes()),
        }
    }
}

impl InputMedia for SyntheticInput {
    fn streams(&self) -> &[InputStream] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Packet, CodecError> {
        let video_left = self.clip.video && self.next_video < self.clip.video_frames();
        let audio_left = self.clip.audio && self.next_audio < self.clip.audio_frames();

        match (video_left, audio_left) {
            (false, false) => Err(CodecError::Eof),
            (true, false) => Ok(self.next_video_packet()),
            (false, true) => Ok(self.next_audio_packet()),
            (true, true) => {
                let video_us = rescale(
                    self.video_pts(self.next_video),
                    SyntheticClip::video_time_base(),
                    Rational::MICROS,
                );
                let audio_us = rescale(
                    self.audio_pts(self.next_audio),
                    self.clip.audio_time_base(),
                    Rational::MICROS,
                );
                if video_us <= audio_us {
                    Ok(self.next_video_packet())
                } else {
                    Ok(self.next_audio_packet())
                }
            }
        }
    }
}

struct SyntheticDecoder {
    kind: MediaKind,
    channels: usize,
    frame_size: usize,
    queue: VecDeque<Frame>,
    flushing: bool,
}

impl Decoder for SyntheticDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), CodecError> {
        let Some(packet) = packet else {
            self.flushing = true;
            return Ok(());
        };
        if packet.data.as_ref() == CORRUPT_MARKER {
            return Err(CodecError::InvalidData("corrupt synthetic packet".into()));
        }

        let frame = match self.kind {
            MediaKind::Video => Frame {
                kind: MediaKind::Video,
                pts: packet.pts,
                dts: packet.dts,
                duration: packet.duration,
                is_keyframe: packet.is_keyframe,
                nb_samples: 0,
                data: FrameData::Picture(packet.data.clone()),
            },
            MediaKind::Audio => Frame {
                kind: MediaKind::Audio,
                pts: packet.pts,
                dts: packet.dts,
                duration: packet.duration,
                is_keyframe: true,
                nb_samples: self.frame_size,
                data: FrameData::Samples(vec![vec![0.0; self.frame_size]; self.channels.max(1)]),
            },
        };
        self.queue.push_back(frame);
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Frame, CodecError> {
        match self.queue.pop_front() {
            Some(frame) => Ok(frame),
            None if self.flushing => Err(CodecError::Eof),
            None => Err(CodecError::Again),
        }
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }
}

struct SyntheticEncoder {
    kind: MediaKind,
    time_base: Rational,
    frame_size: usize,
    queue: VecDeque<EncodedPacket>,
    flushing: bool,
}

impl SyntheticEncoder {
    fn encode_video(&self, frame: &Frame) -> Result<EncodedPacket, CodecError> {
        let picture = match &frame.data {
            FrameData::Picture(data) | FrameData::Passthrough(data) => data,
            FrameData::Samples(_) => {
                return Err(CodecError::InvalidData("video encoder got samples".into()))
            }
        };
        let pts = frame.pts.unwrap_or(0);
        let size = if frame.is_keyframe { 1200 } else { 400 };
        let mut data = BytesMut::with_capacity(size);
        data.put_slice(&[0x00, 0x00, 0x01, 0xB3]);
        data.put_slice(picture);
        data.resize(size, 0xAA);
        Ok(
            EncodedPacket::new(MediaKind::Video, pts, frame.dts.unwrap_or(pts), frame.is_keyframe, data.freeze())
                .with_duration(frame.duration),
        )
    }

    fn encode_audio(&self, frame: &Frame) -> Result<EncodedPacket, CodecError> {
        if frame.nb_samples != self.frame_size {
            return Err(CodecError::InvalidData(format!(
                "audio frame has {} samples, encoder requires {}",
                frame.nb_samples, self.frame_size
            )));
        }
        let pts = frame.pts.unwrap_or(0);
        let mut data = BytesMut::with_capacity(768);
        data.put_u16(0x0B77);
        data.resize(768, 0x55);
        Ok(
            EncodedPacket::new(MediaKind::Audio, pts, pts, true, data.freeze())
                .with_duration(self.frame_size as i64),
        )
    }
}

impl Encoder for SyntheticEncoder {
    fn send_frame(&mut self, frame: Option<&Frame>) -> Result<(), CodecError> {
        let Some(frame) = frame else {
            self.flushing = true;
            return Ok(());
        };
        let packet = match self.kind {
            MediaKind::Video => self.encode_video(frame)?,
            MediaKind::Audio => self.encode_audio(frame)?,
        };
        self.queue.push_back(packet);
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<EncodedPacket, CodecError> {
        match self.queue.pop_front() {
            Some(packet) => Ok(packet),
            None if self.flushing => Err(CodecError::Eof),
            None => Err(CodecError::Again),
        }
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn time_base(&self) -> Rational {
        self.time_base
    }
}
