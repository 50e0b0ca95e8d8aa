// 统一低延迟视频流传输系统 - FFmpeg 命令行后端
//
// 使用 ffprobe 获取流信息与时长，使用 ffmpeg 把文件转码为频道输出编码
// （MPEG-2/H.264 + AC-3）的传输流，再在进程内解复用成基本流包。
// 因为转码已在 ffmpeg 中完成，流水线看到的解码器与编码器都是直通的。

use super::ts_demux::TsDemuxer;
use super::{
    CodecError, Decoder, Encoder, EncoderSettings, Frame, FrameData, InputMedia, InputOptions,
    InputStream, MediaBackend, Packet, StreamParams, AC3_FRAME_SIZE,
};
use common::{EncodedPacket, MediaKind, Rational, VideoCodec};
use serde::Deserialize;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

const AC3_BITRATE: &str = "192k";
/// 输出时间戳起点（秒）。流水线只接收 pts > 0 的包，首个关键帧不能落在 0 上
const OUTPUT_TS_OFFSET: &str = "1";

/// ffprobe JSON 输出
#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// 探测到的视频流
#[derive(Debug, Clone, PartialEq)]
pub struct ProbedVideo {
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
}

/// 探测到的音频流
#[derive(Debug, Clone, PartialEq)]
pub struct ProbedAudio {
    pub codec_name: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// 文件探测结果（每种类型只取第一路流）
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbeInfo {
    pub video: Option<ProbedVideo>,
    pub audio: Option<ProbedAudio>,
    pub duration: Option<Duration>,
}

/// 解析 "30000/1001" 形式的帧率
pub fn parse_frame_rate(value: &str) -> Option<Rational> {
    let (num, den) = value.split_once('/')?;
    let num: i32 = num.trim().parse().ok()?;
    let den: i32 = den.trim().parse().ok()?;
    if num <= 0 || den <= 0 {
        return None;
    }
    Some(Rational::new(num, den))
}

/// 解析 ffprobe 的 JSON 输出
pub fn parse_probe_output(json: &str) -> Result<ProbeInfo, CodecError> {
    let output: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| CodecError::InvalidData(format!("ffprobe output: {}", e)))?;

    let mut info = ProbeInfo::default();
    for stream in output.streams {
        match stream.codec_type.as_deref() {
            Some("video") if info.video.is_none() => {
                let (Some(width), Some(height)) = (stream.width, stream.height) else {
                    continue;
                };
                let frame_rate = stream
                    .avg_frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate)
                    .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
                    .unwrap_or(Rational::new(25, 1));
                info.video = Some(ProbedVideo {
                    codec_name: stream.codec_name.unwrap_or_default(),
                    width,
                    height,
                    frame_rate,
                });
            }
            Some("audio") if info.audio.is_none() => {
                let sample_rate = stream
                    .sample_rate
                    .as_deref()
                    .and_then(|rate| rate.parse().ok())
                    .unwrap_or(48_000);
                info.audio = Some(ProbedAudio {
                    codec_name: stream.codec_name.unwrap_or_default(),
                    sample_rate,
                    channels: stream.channels.unwrap_or(2).max(1),
                });
            }
            _ => {}
        }
    }

    info.duration = output
        .format
        .and_then(|format| format.duration)
        .and_then(|duration| duration.parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
        .map(Duration::from_secs_f64);

    Ok(info)
}

/// 根据探测结果与频道已固定的布局生成输入流描述
pub fn output_streams(info: &ProbeInfo, options: &InputOptions) -> Vec<InputStream> {
    let mut streams = Vec::new();

    if let Some(video) = &info.video {
        let fixed = options.layout.and_then(|layout| layout.video);
        let (width, height, frame_rate) = match fixed {
            Some(fixed) => (fixed.width, fixed.height, fixed.frame_rate),
            None => (video.width, video.height, video.frame_rate),
        };
        streams.push(InputStream {
            index: streams.len(),
            kind: MediaKind::Video,
            codec_name: options.video_codec.encoder_name().to_string(),
            time_base: Rational::MPEG_CLOCK,
            params: StreamParams::Video {
                width,
                height,
                frame_rate,
            },
        });
    }

    if let Some(audio) = &info.audio {
        let fixed = options.layout.and_then(|layout| layout.audio);
        let (sample_rate, channels) = match fixed {
            Some(fixed) => (fixed.sample_rate, fixed.channels),
            None => (audio.sample_rate, audio.channels),
        };
        streams.push(InputStream {
            index: streams.len(),
            kind: MediaKind::Audio,
            codec_name: "ac3".to_string(),
            time_base: Rational::MPEG_CLOCK,
            params: StreamParams::Audio {
                sample_rate,
                channels,
                frame_size: AC3_FRAME_SIZE,
            },
        });
    }

    streams
}

/// 生成 ffmpeg 转码参数
///
/// # 参数
///
/// * `path` - 输入文件
/// * `streams` - `output_streams` 的结果，决定映射哪些流以及目标参数
/// * `video_codec` - 频道视频编码
/// * `fixed` - 是否强制缩放/重采样到 `streams` 中的参数
pub fn transcode_args(
    path: &Path,
    streams: &[InputStream],
    video_codec: VideoCodec,
    fixed: bool,
) -> Vec<String> {
    let mut args = Vec::new();
    push_args(&mut args, &["-nostdin", "-hide_banner", "-loglevel", "error", "-i"]);
    args.push(path.to_string_lossy().into_owned());

    for stream in streams {
        match stream.params {
            StreamParams::Video {
                width,
                height,
                frame_rate,
            } => {
                push_args(&mut args, &["-map", "0:v:0", "-c:v", video_codec.encoder_name()]);
                match video_codec {
                    VideoCodec::Mpeg2 => push_args(&mut args, &["-qscale:v", "3"]),
                    VideoCodec::H264 => push_args(
                        &mut args,
                        &["-profile:v", "main", "-preset", "superfast", "-tune", "zerolatency", "-crf", "22"],
                    ),
                }
                push_args(&mut args, &["-pix_fmt", "yuv420p"]);
                if fixed {
                    args.push("-vf".into());
                    args.push(format!("scale={}:{}", width, height));
                    args.push("-r".into());
                    args.push(frame_rate.to_string());
                }
            }
            StreamParams::Audio {
                sample_rate,
                channels,
                ..
            } => {
                push_args(&mut args, &["-map", "0:a:0", "-c:a", "ac3", "-b:a", AC3_BITRATE]);
                if fixed {
                    args.push("-ar".into());
                    args.push(sample_rate.to_string());
                    args.push("-ac".into());
                    args.push(channels.to_string());
                }
            }
        }
    }

    push_args(
        &mut args,
        &[
            "-muxdelay",
            "0",
            "-muxpreload",
            "0",
            "-output_ts_offset",
            OUTPUT_TS_OFFSET,
            "-pes_payload_size",
            "0",
            "-f",
            "mpegts",
            "pipe:1",
        ],
    );
    args
}

fn push_args(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|item| item.to_string()));
}

/// FFmpeg 命令行后端
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg_path: PathBuf,
    ffprobe_path: PathBuf,
}

impl FfmpegBackend {
    pub fn new(ffmpeg_path: impl Into<PathBuf>, ffprobe_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    /// 运行 ffprobe
    pub fn probe(&self, path: &Path) -> Result<ProbeInfo, CodecError> {
        let open_error = |reason: String| CodecError::Open {
            path: path.display().to_string(),
            reason,
        };

        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "error", "-print_format", "json", "-show_streams", "-show_format"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| open_error(format!("failed to execute ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(open_error(format!("ffprobe failed: {}", stderr.trim())));
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }
}

impl MediaBackend for FfmpegBackend {
    fn open_input(
        &self,
        path: &Path,
        options: &InputOptions,
    ) -> Result<Box<dyn InputMedia>, CodecError> {
        let info = self.probe(path)?;
        let streams = output_streams(&info, options);
        if streams.is_empty() {
            return Err(CodecError::Open {
                path: path.display().to_string(),
                reason: "no audio or video streams".into(),
            });
        }

        let args = transcode_args(path, &streams, options.video_codec, options.layout.is_some());
        debug!("Starting ffmpeg with args: {:?}", args);

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CodecError::Open {
                path: path.display().to_string(),
                reason: format!("failed to start ffmpeg: {}", e),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| CodecError::Open {
            path: path.display().to_string(),
            reason: "ffmpeg stdout unavailable".into(),
        })?;

        if let Some(stderr) = child.stderr.take() {
            let label = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let spawned = std::thread::Builder::new()
                .name("ffmpeg-stderr".into())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                        if !line.trim().is_empty() {
                            warn!("ffmpeg [{}]: {}", label, line);
                        }
                    }
                });
            if let Err(e) = spawned {
                warn!("Failed to start ffmpeg stderr reader: {}", e);
            }
        }

        info!(
            "Transcoding {:?} ({} streams, {:?})",
            path,
            streams.len(),
            info.duration
        );

        Ok(Box::new(FfmpegInput {
            child,
            demuxer: TsDemuxer::new(BufReader::new(stdout)),
            streams,
        }))
    }

    fn open_decoder(&self, stream: &InputStream) -> Result<Box<dyn Decoder>, CodecError> {
        let frame_size = match stream.params {
            StreamParams::Audio { frame_size, .. } => frame_size,
            StreamParams::Video { .. } => 0,
        };
        Ok(Box::new(PassthroughDecoder {
            kind: stream.kind,
            frame_size,
            queue: VecDeque::new(),
            flushing: false,
        }))
    }

    fn open_encoder(&self, settings: &EncoderSettings) -> Result<Box<dyn Encoder>, CodecError> {
        Ok(Box::new(PassthroughEncoder {
            kind: settings.kind,
            queue: VecDeque::new(),
            flushing: false,
        }))
    }

    fn probe_duration(&self, path: &Path) -> Option<Duration> {
        match self.probe(path) {
            Ok(info) => info.duration,
            Err(e) => {
                debug!("Duration probe failed for {:?}: {}", path, e);
                None
            }
        }
    }
}

/// ffmpeg 转码进程的输出
struct FfmpegInput {
    child: Child,
    demuxer: TsDemuxer<BufReader<ChildStdout>>,
    streams: Vec<InputStream>,
}

impl InputMedia for FfmpegInput {
    fn streams(&self) -> &[InputStream] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Packet, CodecError> {
        loop {
            let Some(pes) = self.demuxer.next_pes()? else {
                return Err(CodecError::Eof);
            };
            let Some(stream) = self.streams.iter().find(|stream| stream.kind == pes.kind) else {
                continue;
            };
            return Ok(Packet {
                stream_index: stream.index,
                pts: pes.pts,
                dts: pes.dts.or(pes.pts),
                duration: 0,
                is_keyframe: pes.random_access || pes.kind == MediaKind::Audio,
                data: pes.data,
            });
        }
    }
}

impl Drop for FfmpegInput {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("ffmpeg already exited: {}", e);
        }
        if let Err(e) = self.child.wait() {
            warn!("Failed to reap ffmpeg process: {}", e);
        }
    }
}

/// 直通解码器：包原样变成帧
struct PassthroughDecoder {
    kind: MediaKind,
    frame_size: usize,
    queue: VecDeque<Frame>,
    flushing: bool,
}

impl Decoder for PassthroughDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), CodecError> {
        let Some(packet) = packet else {
            self.flushing = true;
            return Ok(());
        };
        self.queue.push_back(Frame {
            kind: self.kind,
            pts: packet.pts,
            dts: packet.dts,
            duration: packet.duration,
            is_keyframe: packet.is_keyframe,
            nb_samples: self.frame_size,
            data: FrameData::Passthrough(packet.data.clone()),
        });
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

/// 直通编码器：只接受已编码的数据
struct PassthroughEncoder {
    kind: MediaKind,
    queue: VecDeque<EncodedPacket>,
    flushing: bool,
}

impl Encoder for PassthroughEncoder {
    fn send_frame(&mut self, frame: Option<&Frame>) -> Result<(), CodecError> {
        let Some(frame) = frame else {
            self.flushing = true;
            return Ok(());
        };
        let FrameData::Passthrough(data) = &frame.data else {
            return Err(CodecError::Unsupported(format!(
                "{} passthrough encoder needs encoded data",
                self.kind
            )));
        };
        let pts = frame.pts.unwrap_or(0);
        self.queue.push_back(
            EncodedPacket::new(
                self.kind,
                pts,
                frame.dts.unwrap_or(pts),
                frame.is_keyframe,
                data.clone(),
            )
            .with_duration(frame.duration),
        );
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<EncodedPacket, CodecError> {
        match self.queue.pop_front() {
            Some(packet) => Ok(packet),
            None if self.flushing => Err(CodecError::Eof),
            None => Err(CodecError::Again),
        }
    }

    fn time_base(&self) -> Rational {
        Rational::MPEG_CLOCK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AudioOutput, OutputLayout, VideoOutput};
    use bytes::Bytes;

    const PROBE_JSON: &str = r#"{
        "streams": [
            {"index": 0, "codec_name": "h264", "codec_type": "video", "width": 1920, "height": 1080,
             "r_frame_rate": "30000/1001", "avg_frame_rate": "30000/1001"},
            {"index": 1, "codec_name": "aac", "codec_type": "audio", "sample_rate": "44100", "channels": 2},
            {"index": 2, "codec_name": "aac", "codec_type": "audio", "sample_rate": "48000", "channels": 6},
            {"index": 3, "codec_name": "subrip", "codec_type": "subtitle"}
        ],
        "format": {"filename": "movie.mkv", "duration": "5423.104000"}
    }"#;

    fn options(layout: Option<OutputLayout>) -> InputOptions {
        InputOptions {
            video_codec: VideoCodec::H264,
            layout,
        }
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25/1"), Some(Rational::new(25, 1)));
        assert_eq!(parse_frame_rate("30000/1001"), Some(Rational::new(30000, 1001)));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_parse_probe_output() {
        let info = parse_probe_output(PROBE_JSON).unwrap();
        let video = info.video.unwrap();
        assert_eq!((video.width, video.height), (1920, 1080));
        assert_eq!(video.frame_rate, Rational::new(30000, 1001));

        // 只取第一路音频
        let audio = info.audio.unwrap();
        assert_eq!(audio.sample_rate, 44_100);
        assert_eq!(audio.channels, 2);

        let duration = info.duration.unwrap();
        assert_eq!(duration.as_secs(), 5423);
    }

    #[test]
    fn test_parse_probe_rejects_garbage() {
        assert!(matches!(
            parse_probe_output("not json"),
            Err(CodecError::InvalidData(_))
        ));
        let empty = parse_probe_output(r#"{"streams": []}"#).unwrap();
        assert_eq!(empty, ProbeInfo::default());
    }

    #[test]
    fn test_output_streams_follow_fixed_layout() {
        let info = parse_probe_output(PROBE_JSON).unwrap();

        let first = output_streams(&info, &options(None));
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].codec_name, "libx264");
        assert_eq!(first[1].index, 1);
        assert_eq!(
            first[1].params,
            StreamParams::Audio {
                sample_rate: 44_100,
                channels: 2,
                frame_size: AC3_FRAME_SIZE
            }
        );

        let layout = OutputLayout {
            video: Some(VideoOutput {
                codec: VideoCodec::H264,
                width: 1280,
                height: 720,
                frame_rate: Rational::new(25, 1),
                time_base: Rational::MPEG_CLOCK,
            }),
            audio: Some(AudioOutput {
                sample_rate: 48_000,
                channels: 2,
                frame_size: AC3_FRAME_SIZE,
                time_base: Rational::MPEG_CLOCK,
            }),
        };
        let later = output_streams(&info, &options(Some(layout)));
        assert_eq!(
            later[0].params,
            StreamParams::Video {
                width: 1280,
                height: 720,
                frame_rate: Rational::new(25, 1)
            }
        );
    }

    #[test]
    fn test_transcode_args() {
        let info = parse_probe_output(PROBE_JSON).unwrap();
        let streams = output_streams(&info, &options(None));

        let args = transcode_args(Path::new("/media/a.mkv"), &streams, VideoCodec::H264, false);
        let joined = args.join(" ");
        assert!(joined.starts_with("-nostdin -hide_banner -loglevel error -i /media/a.mkv"));
        assert!(joined.contains("-map 0:v:0 -c:v libx264 -profile:v main -preset superfast"));
        assert!(joined.contains("-map 0:a:0 -c:a ac3"));
        assert!(!joined.contains("scale="));
        assert!(joined.contains("-output_ts_offset 1"));
        assert!(joined.ends_with("-f mpegts pipe:1"));

        let fixed = transcode_args(Path::new("/media/b.mp4"), &streams, VideoCodec::Mpeg2, true);
        let joined = fixed.join(" ");
        assert!(joined.contains("-c:v mpeg2video"));
        assert!(joined.contains("-vf scale=1920:1080 -r 30000/1001"));
        assert!(joined.contains("-ar 44100 -ac 2"));
    }

    #[test]
    fn test_missing_ffprobe_is_open_error() {
        let backend = FfmpegBackend::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        let result = backend.open_input(Path::new("/tmp/a.mkv"), &options(None));
        assert!(matches!(result, Err(CodecError::Open { .. })));
        assert_eq!(backend.probe_duration(Path::new("/tmp/a.mkv")), None);
    }

    #[test]
    fn test_passthrough_codecs() {
        let backend = FfmpegBackend::new("ffmpeg", "ffprobe");
        let info = parse_probe_output(PROBE_JSON).unwrap();
        let streams = output_streams(&info, &options(None));

        let mut decoder = backend.open_decoder(&streams[1]).unwrap();
        assert_eq!(decoder.frame_size(), AC3_FRAME_SIZE);
        let packet = Packet {
            stream_index: 1,
            pts: Some(9000),
            dts: Some(9000),
            duration: 0,
            is_keyframe: true,
            data: Bytes::from_static(b"\x0b\x77ac3"),
        };
        decoder.send_packet(Some(&packet)).unwrap();
        let frame = decoder.receive_frame().unwrap();
        assert_eq!(decoder.receive_frame(), Err(CodecError::Again));

        let settings = EncoderSettings {
            kind: MediaKind::Audio,
            video_codec: VideoCodec::H264,
            source: streams[1].params,
            source_time_base: Rational::MPEG_CLOCK,
        };
        let mut encoder = backend.open_encoder(&settings).unwrap();
        assert_eq!(encoder.frame_size(), 0);
        assert_eq!(encoder.time_base(), Rational::MPEG_CLOCK);
        encoder.send_frame(Some(&frame)).unwrap();
        let encoded = encoder.receive_packet().unwrap();
        assert_eq!(encoded.pts, 9000);
        assert_eq!(encoded.data, packet.data);

        encoder.send_frame(None).unwrap();
        assert_eq!(encoder.receive_packet(), Err(CodecError::Eof));
    }
}
