use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn other(&self) -> MediaKind {
        match self {
            MediaKind::Video => MediaKind::Audio,
            MediaKind::Audio => MediaKind::Video,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// 播放列表排序方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    /// 按文件名字母顺序
    #[default]
    Alpha,
    /// 每轮随机打乱
    Random,
}

/// 频道输出视频编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    Mpeg2,
    H264,
}

impl VideoCodec {
    /// 传输流 PMT 中的 stream_type
    pub fn stream_type(&self) -> u8 {
        match self {
            VideoCodec::Mpeg2 => 0x02,
            VideoCodec::H264 => 0x1B,
        }
    }

    /// 编码器名称
    pub fn encoder_name(&self) -> &'static str {
        match self {
            VideoCodec::Mpeg2 => "mpeg2video",
            VideoCodec::H264 => "libx264",
        }
    }
}

/// 编码后的媒体包
///
/// 时间戳以产生该包的编码器时间基为单位。
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPacket {
    pub kind: MediaKind,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub is_keyframe: bool,
    pub data: Bytes,
}

impl EncodedPacket {
    pub fn new(kind: MediaKind, pts: i64, dts: i64, is_keyframe: bool, data: Bytes) -> Self {
        Self {
            kind,
            pts,
            dts,
            duration: 0,
            is_keyframe,
            data,
        }
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }
}

/// 频道运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    /// 尚未打开输出编码器
    Starting,
    /// 正在播放文件
    Playing,
    /// 播放列表为空或按需频道无客户端
    Idle,
    /// 输出编码器无法打开，拒绝新客户端
    Faulted,
}

/// 频道信息（HTTP API 返回）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub number: u32,
    pub name: String,
    pub status: ChannelStatus,
    pub now_playing: Option<String>,
    pub epoch: u64,
    pub active_clients: usize,
    pub last_sequence: u64,
}
