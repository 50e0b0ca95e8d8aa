// 统一低延迟视频流传输系统 - 编解码抽象层
//
// 流水线只依赖本模块定义的能力：打开输入、解码、编码。
// 具体实现由后端提供：
//
// - `ffmpeg_cli`: 调用 ffmpeg/ffprobe 命令行转码，输出传输流在进程内解复用
// - `synthetic`: 确定性的合成片源，用于测试及无 ffmpeg 环境下的冒烟运行

pub mod audio_fifo;
pub mod ffmpeg_cli;
pub mod synthetic;
pub mod ts_demux;

use bytes::Bytes;
use common::{EncodedPacket, MediaKind, Rational, VideoCodec};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use audio_fifo::AudioFifo;
pub use ffmpeg_cli::FfmpegBackend;
pub use synthetic::SyntheticBackend;

/// AC-3 每帧采样数
pub const AC3_FRAME_SIZE: usize = 1536;

/// 编解码错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CodecError {
    /// 暂无输出，需要更多输入
    #[error("Resource temporarily unavailable")]
    Again,

    /// 输入或编解码器已结束
    #[error("End of stream")]
    Eof,

    /// 输入数据损坏
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// 无法打开文件
    #[error("Cannot open {path}: {reason}")]
    Open { path: String, reason: String },

    /// 不支持的流或参数
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// 其他失败
    #[error("Codec failure: {0}")]
    Failed(String),
}

impl From<std::io::Error> for CodecError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::UnexpectedEof => CodecError::Eof,
            _ => CodecError::Failed(error.to_string()),
        }
    }
}

/// 流参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamParams {
    Video {
        width: u32,
        height: u32,
        frame_rate: Rational,
    },
    Audio {
        sample_rate: u32,
        channels: u16,
        /// 原生每帧采样数（0 表示可变）
        frame_size: usize,
    },
}

/// 输入文件中的一路流
#[derive(Debug, Clone, PartialEq)]
pub struct InputStream {
    pub index: usize,
    pub kind: MediaKind,
    pub codec_name: String,
    pub time_base: Rational,
    pub params: StreamParams,
}

/// 解复用得到的压缩包
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub is_keyframe: bool,
    pub data: Bytes,
}

/// 帧内容
#[derive(Debug, Clone, PartialEq)]
pub enum FrameData {
    /// 解码后的图像
    Picture(Bytes),
    /// 平面 PCM 采样（每声道一个向量）
    Samples(Vec<Vec<f32>>),
    /// 已是目标编码的数据，编码器直接转发
    Passthrough(Bytes),
}

/// 解码后的帧
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: MediaKind,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub is_keyframe: bool,
    /// 音频帧采样数，视频帧为 0
    pub nb_samples: usize,
    pub data: FrameData,
}

/// 打开输入时的转码目标
#[derive(Debug, Clone, PartialEq)]
pub struct InputOptions {
    pub video_codec: VideoCodec,
    /// 频道已固定的输出参数，首个文件打开时为 `None`
    pub layout: Option<OutputLayout>,
}

/// 频道视频输出参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoOutput {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub time_base: Rational,
}

/// 频道音频输出参数（AC-3）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioOutput {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
    pub time_base: Rational,
}

/// 频道输出布局，首个文件打开编码器后固定，客户端会话据此描述容器参数
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OutputLayout {
    pub video: Option<VideoOutput>,
    pub audio: Option<AudioOutput>,
}

/// 编码器设置
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub kind: MediaKind,
    pub video_codec: VideoCodec,
    /// 来自首个文件解码流的参数
    pub source: StreamParams,
    /// 首个文件该流的时间基
    pub source_time_base: Rational,
}

/// 已打开的输入文件
pub trait InputMedia: Send {
    fn streams(&self) -> &[InputStream];

    /// 读取下一个包，文件结束返回 `CodecError::Eof`
    fn read_packet(&mut self) -> Result<Packet, CodecError>;
}

/// 解码器
pub trait Decoder: Send {
    /// 送入一个包，`None` 表示冲刷
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), CodecError>;

    /// 取出一帧，暂无输出返回 `Again`，冲刷完毕返回 `Eof`
    fn receive_frame(&mut self) -> Result<Frame, CodecError>;

    /// 原生音频帧大小（0 表示可变或视频）
    fn frame_size(&self) -> usize {
        0
    }
}

/// 编码器
pub trait Encoder: Send {
    /// 送入一帧，`None` 表示冲刷
    fn send_frame(&mut self, frame: Option<&Frame>) -> Result<(), CodecError>;

    /// 取出一个编码包，暂无输出返回 `Again`
    fn receive_packet(&mut self) -> Result<EncodedPacket, CodecError>;

    /// 要求的音频帧大小（0 表示任意）
    fn frame_size(&self) -> usize {
        0
    }

    /// 输出包时间戳的时间基
    fn time_base(&self) -> Rational;
}

/// 媒体编解码后端
pub trait MediaBackend: Send + Sync {
    fn open_input(
        &self,
        path: &Path,
        options: &InputOptions,
    ) -> Result<Box<dyn InputMedia>, CodecError>;

    fn open_decoder(&self, stream: &InputStream) -> Result<Box<dyn Decoder>, CodecError>;

    fn open_encoder(&self, settings: &EncoderSettings) -> Result<Box<dyn Encoder>, CodecError>;

    /// 文件时长（节目单使用），无法获知时返回 `None`
    fn probe_duration(&self, path: &Path) -> Option<Duration>;
}

/// 在流列表中查找第一路指定类型的流
pub fn find_first_stream(streams: &[InputStream], kind: MediaKind) -> Option<&InputStream> {
    streams.iter().find(|stream| stream.kind == kind)
}

/// 根据首个文件的流参数生成频道输出布局
pub fn layout_from_encoders(
    video: Option<(&EncoderSettings, Rational)>,
    audio: Option<(&EncoderSettings, Rational, usize)>,
) -> OutputLayout {
    let video = video.and_then(|(settings, time_base)| match settings.source {
        StreamParams::Video {
            width,
            height,
            frame_rate,
        } => Some(VideoOutput {
            codec: settings.video_codec,
            width,
            height,
            frame_rate,
            time_base,
        }),
        StreamParams::Audio { .. } => None,
    });

    let audio = audio.and_then(|(settings, time_base, frame_size)| match settings.source {
        StreamParams::Audio {
            sample_rate,
            channels,
            ..
        } => Some(AudioOutput {
            sample_rate,
            channels,
            frame_size,
            time_base,
        }),
        StreamParams::Video { .. } => None,
    });

    OutputLayout { video, audio }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_stream() -> InputStream {
        InputStream {
            index: 0,
            kind: MediaKind::Video,
            codec_name: "h264".into(),
            time_base: Rational::new(1, 1000),
            params: StreamParams::Video {
                width: 640,
                height: 360,
                frame_rate: Rational::new(25, 1),
            },
        }
    }

    #[test]
    fn test_find_first_stream() {
        let streams = vec![video_stream()];
        assert!(find_first_stream(&streams, MediaKind::Video).is_some());
        assert!(find_first_stream(&streams, MediaKind::Audio).is_none());
    }

    #[test]
    fn test_layout_from_encoders() {
        let stream = video_stream();
        let settings = EncoderSettings {
            kind: MediaKind::Video,
            video_codec: VideoCodec::H264,
            source: stream.params,
            source_time_base: stream.time_base,
        };
        let layout = layout_from_encoders(Some((&settings, Rational::new(1, 1000))), None);
        let video = layout.video.unwrap();
        assert_eq!(video.codec, VideoCodec::H264);
        assert_eq!(video.width, 640);
        assert!(layout.audio.is_none());
    }

    #[test]
    fn test_io_error_conversion() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(CodecError::from(eof), CodecError::Eof);
        let other = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(matches!(CodecError::from(other), CodecError::Failed(_)));
    }
}
