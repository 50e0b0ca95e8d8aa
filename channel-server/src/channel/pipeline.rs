// 统一低延迟视频流传输系统 - 频道流水线
//
// 流水线在频道专属的系统线程上运行，把播放列表中互不相关的文件依次
// 解码、再用频道固定的输出编码器编码，追加到环形缓冲区。
//
// # 文件生命周期
//
// 1. 打开文件，找到第一路视频/音频流并打开解码器
// 2. 首个可用文件决定输出编码器参数，之后所有文件复用这些编码器
// 3. 向前读取（最多 `probe_packet_limit` 个包）确定各流的起始时间戳
// 4. 开始新的文件代，逐包解码、编码、追加
// 5. 文件结束后冲刷解码器，进入下一个条目

use super::guide::GuideNotifier;
use super::pacer::{PaceDecision, RealtimePacer};
use super::playlist::{PlaylistEntry, PlaylistProvider};
use super::{sleep_cancellable, ChannelShared};
use crate::buffer::SlotMeta;
use crate::codec::{
    find_first_stream, layout_from_encoders, AudioFifo, CodecError, Decoder, Encoder,
    EncoderSettings, Frame, InputMedia, InputOptions, InputStream, MediaBackend, Packet,
    StreamParams, AC3_FRAME_SIZE,
};
use crate::config::{ChannelConfig, MediaConfig};
use crate::error::{BackoffPolicy, RetryStrategy};
use chrono::Local;
use common::{rescale, ChannelStatus, MediaKind, Rational, VideoCodec};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 按需频道等待客户端时的轮询间隔
const DEMAND_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEMAND_MAX_POLLS: u32 = 1000;

/// 流水线参数
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub video_codec: VideoCodec,
    pub probe_packet_limit: usize,
    pub resync_threshold: Duration,
    /// 只在有客户端连接时生产
    pub on_demand: bool,
    pub demand_poll_interval: Duration,
    pub demand_max_polls: u32,
    /// 播放列表为空或不可读时的重试策略
    pub playlist_retry: BackoffPolicy,
}

impl PipelineSettings {
    pub fn new(media: &MediaConfig, channel: &ChannelConfig) -> Self {
        Self {
            video_codec: channel.encoder,
            probe_packet_limit: media.probe_packet_limit,
            resync_threshold: media.resync_threshold(),
            on_demand: channel.on_demand,
            demand_poll_interval: DEMAND_POLL_INTERVAL,
            demand_max_polls: DEMAND_MAX_POLLS,
            playlist_retry: BackoffPolicy {
                retry_strategy: RetryStrategy::ExponentialBackoff,
                backoff_base: Duration::from_secs(1),
                backoff_max: Duration::from_secs(30),
            },
        }
    }
}

/// 单个文件的播放统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    pub epoch: u64,
    pub packets_read: u64,
    pub packets_appended: u64,
    pub decode_errors: u64,
    pub encode_errors: u64,
    /// 节奏控制失步重锚次数
    pub reanchors: u64,
}

/// 当前文件中的一路流
struct Track {
    kind: MediaKind,
    stream_index: usize,
    time_base: Rational,
    params: StreamParams,
    decoder: Box<dyn Decoder>,
    /// 输入时间基下的起始时间戳
    start_pts: Option<i64>,
    /// 编码器时间基下的起始时间戳
    epoch_start_out: i64,
    /// 音频帧大小与编码器不一致，需经 FIFO 重新切分
    rechunk: bool,
}

/// 频道固定的输出编码器
#[derive(Default)]
struct OutputEncoders {
    video: Option<Box<dyn Encoder>>,
    audio: Option<Box<dyn Encoder>>,
    /// 跨文件复用，每个文件开始时清空
    audio_fifo: Option<AudioFifo>,
    opened: bool,
}

impl OutputEncoders {
    fn get_mut(&mut self, kind: MediaKind) -> Option<&mut (dyn Encoder + 'static)> {
        match kind {
            MediaKind::Video => self.video.as_deref_mut(),
            MediaKind::Audio => self.audio.as_deref_mut(),
        }
    }

    fn has(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.video.is_some(),
            MediaKind::Audio => self.audio.is_some(),
        }
    }
}

/// 正在播放的文件
struct FilePlayback {
    input: Box<dyn InputMedia>,
    video: Option<Track>,
    audio: Option<Track>,
    /// 探测起始时间戳时读到的包
    pending: VecDeque<Packet>,
    epoch: u64,
    stats: FileStats,
}

impl FilePlayback {
    fn kind_of(&self, stream_index: usize) -> Option<MediaKind> {
        [&self.video, &self.audio]
            .into_iter()
            .flatten()
            .find(|track| track.stream_index == stream_index)
            .map(|track| track.kind)
    }

    fn track_mut(&mut self, kind: MediaKind) -> Option<&mut Track> {
        match kind {
            MediaKind::Video => self.video.as_mut(),
            MediaKind::Audio => self.audio.as_mut(),
        }
    }

    fn tracks_started(&self) -> bool {
        [&self.video, &self.audio]
            .into_iter()
            .flatten()
            .all(|track| track.start_pts.is_some())
    }

    fn next_packet(&mut self) -> Result<Packet, CodecError> {
        match self.pending.pop_front() {
            Some(packet) => Ok(packet),
            None => self.input.read_packet(),
        }
    }
}

/// 频道流水线
pub struct Pipeline {
    channel: Arc<ChannelShared>,
    backend: Arc<dyn MediaBackend>,
    playlist: Box<dyn PlaylistProvider>,
    settings: PipelineSettings,
    guide: Option<GuideNotifier>,
    encoders: OutputEncoders,
    pacer: Option<RealtimePacer>,
}

impl Pipeline {
    pub fn new(
        channel: Arc<ChannelShared>,
        backend: Arc<dyn MediaBackend>,
        playlist: Box<dyn PlaylistProvider>,
        settings: PipelineSettings,
        guide: Option<GuideNotifier>,
    ) -> Self {
        Self {
            channel,
            backend,
            playlist,
            settings,
            guide,
            encoders: OutputEncoders::default(),
            pacer: None,
        }
    }

    pub fn channel_number(&self) -> u32 {
        self.channel.number()
    }

    fn should_stop(&self) -> bool {
        self.channel.is_cancelled() || self.channel.is_faulted()
    }

    /// 循环播放直到频道关闭或故障
    pub fn run(mut self) {
        let number = self.channel.number();
        info!("ch{}: Starting channel {}", number, self.channel.name());

        let mut idle_rounds = 0u32;
        while !self.should_stop() {
            if self.play_cycle() > 0 {
                idle_rounds = 0;
                continue;
            }
            if self.should_stop() {
                break;
            }

            let delay = self.settings.playlist_retry.calculate_delay(idle_rounds);
            idle_rounds = idle_rounds.saturating_add(1);
            self.channel.set_status(ChannelStatus::Idle);
            warn!("ch{}: Nothing playable, retrying in {:?}", number, delay);
            if !sleep_cancellable(delay, self.channel.cancel_token()) {
                break;
            }
        }

        self.channel.set_now_playing(None);
        info!("ch{}: Finished", number);
    }

    /// 播放一整轮播放列表
    ///
    /// # 返回
    ///
    /// 成功开始播放的文件数
    pub fn play_cycle(&mut self) -> usize {
        let number = self.channel.number();
        let entries = match self.playlist.enumerate() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("ch{}: Cannot read playlist: {}", number, e);
                return 0;
            }
        };
        if entries.is_empty() {
            warn!("ch{}: Playlist is empty", number);
            return 0;
        }

        let mut played = 0;
        for (index, entry) in entries.iter().enumerate() {
            if self.should_stop() {
                break;
            }
            info!("ch{}: Playing: {}", number, entry.title);
            self.announce(&entries, index);

            match self.play_file(entry) {
                Ok(stats) => {
                    played += 1;
                    info!(
                        "ch{}: Finished {} (epoch {}, {} packets read, {} appended, {} decode errors)",
                        number,
                        entry.title,
                        stats.epoch,
                        stats.packets_read,
                        stats.packets_appended,
                        stats.decode_errors
                    );
                }
                Err(e) => warn!("ch{}: Skipping {:?}: {}", number, entry.path, e),
            }
        }
        self.channel.set_now_playing(None);
        played
    }

    fn announce(&self, entries: &[PlaylistEntry], index: usize) {
        let Some(guide) = &self.guide else {
            return;
        };
        let current = &entries[index];
        let next = &entries[(index + 1) % entries.len()];
        let programmes = GuideNotifier::schedule(
            Local::now(),
            (current, self.backend.probe_duration(&current.path)),
            (next, self.backend.probe_duration(&next.path)),
        );
        match guide.render_xmltv(&programmes) {
            Ok(xml) => guide.publish(&xml),
            Err(e) => warn!("ch{}: {}", self.channel.number(), e),
        }
    }

    /// 播放单个文件
    ///
    /// 文件无法打开或没有可用的流时返回错误，频道继续下一个条目；
    /// 输出编码器无法打开时频道进入故障状态。
    pub fn play_file(&mut self, entry: &PlaylistEntry) -> Result<FileStats, CodecError> {
        let number = self.channel.number();
        let options = InputOptions {
            video_codec: self.settings.video_codec,
            layout: self.channel.layout(),
        };
        let input = self.backend.open_input(&entry.path, &options)?;

        let mut video = self.open_track(input.streams(), MediaKind::Video);
        let mut audio = self.open_track(input.streams(), MediaKind::Audio);
        if video.is_none() && audio.is_none() {
            return Err(CodecError::Unsupported(
                "no decodable audio or video stream".into(),
            ));
        }

        if !self.encoders.opened {
            self.open_encoders(video.as_ref(), audio.as_ref())?;
        }
        if video.is_some() && !self.encoders.has(MediaKind::Video) {
            debug!("ch{}: channel has no video output, ignoring video stream", number);
            video = None;
        }
        if audio.is_some() && !self.encoders.has(MediaKind::Audio) {
            debug!("ch{}: channel has no audio output, ignoring audio stream", number);
            audio = None;
        }
        if video.is_none() && audio.is_none() {
            return Err(CodecError::Unsupported(
                "no stream matches the channel output".into(),
            ));
        }

        let mut playback = FilePlayback {
            input,
            video,
            audio,
            pending: VecDeque::new(),
            epoch: 0,
            stats: FileStats::default(),
        };
        self.probe_start(&mut playback);
        self.begin_epoch(&mut playback);
        self.channel.set_now_playing(Some(entry.title.clone()));
        self.channel.set_status(ChannelStatus::Playing);

        self.process(&mut playback);
        for kind in [MediaKind::Video, MediaKind::Audio] {
            self.decode(&mut playback, kind, None);
        }
        Ok(playback.stats)
    }

    fn open_track(&self, streams: &[InputStream], kind: MediaKind) -> Option<Track> {
        let stream = find_first_stream(streams, kind)?;
        match self.backend.open_decoder(stream) {
            Ok(decoder) => Some(Track {
                kind,
                stream_index: stream.index,
                time_base: stream.time_base,
                params: stream.params,
                decoder,
                start_pts: None,
                epoch_start_out: 0,
                rechunk: false,
            }),
            Err(e) => {
                warn!(
                    "ch{}: Could not open {} decoder ({}): {}",
                    self.channel.number(),
                    kind,
                    stream.codec_name,
                    e
                );
                None
            }
        }
    }

    /// 用首个可用文件的流参数创建输出编码器并发布输出布局
    fn open_encoders(&mut self, video: Option<&Track>, audio: Option<&Track>) -> Result<(), CodecError> {
        let settings = |track: &Track| EncoderSettings {
            kind: track.kind,
            video_codec: self.settings.video_codec,
            source: track.params,
            source_time_base: track.time_base,
        };
        let video_settings = video.map(settings);
        let audio_settings = audio.map(settings);

        let open = |settings: &Option<EncoderSettings>| -> Result<Option<Box<dyn Encoder>>, CodecError> {
            let Some(settings) = settings else {
                return Ok(None);
            };
            self.backend.open_encoder(settings).map(Some).map_err(|e| {
                self.channel
                    .fault(&format!("could not open {} encoder: {}", settings.kind, e));
                e
            })
        };
        let video_encoder = open(&video_settings)?;
        let audio_encoder = open(&audio_settings)?;

        let layout = layout_from_encoders(
            video_settings
                .as_ref()
                .zip(video_encoder.as_ref())
                .map(|(settings, encoder)| (settings, encoder.time_base())),
            audio_settings
                .as_ref()
                .zip(audio_encoder.as_ref())
                .map(|(settings, encoder)| {
                    let frame_size = match encoder.frame_size() {
                        0 => AC3_FRAME_SIZE,
                        size => size,
                    };
                    (settings, encoder.time_base(), frame_size)
                }),
        );

        info!(
            "ch{}: Output fixed: video {:?}, audio {:?}",
            self.channel.number(),
            layout.video,
            layout.audio
        );
        self.encoders = OutputEncoders {
            video: video_encoder,
            audio: audio_encoder,
            audio_fifo: None,
            opened: true,
        };
        self.channel.publish_layout(layout);
        Ok(())
    }

    /// 向前读取直到每路流都有起始时间戳
    fn probe_start(&self, playback: &mut FilePlayback) {
        let number = self.channel.number();
        for _ in 0..self.settings.probe_packet_limit {
            if playback.tracks_started() {
                break;
            }
            match playback.input.read_packet() {
                Ok(packet) => {
                    if let Some(kind) = playback.kind_of(packet.stream_index) {
                        if let Some(track) = playback.track_mut(kind) {
                            if track.start_pts.is_none() {
                                track.start_pts = packet.pts;
                            }
                        }
                    }
                    playback.pending.push_back(packet);
                }
                Err(CodecError::Eof) => break,
                Err(CodecError::Again) | Err(CodecError::InvalidData(_)) => continue,
                Err(e) => {
                    warn!("ch{}: Read failed while probing: {}", number, e);
                    break;
                }
            }
        }
        if !playback.tracks_started() {
            debug!(
                "ch{}: start timestamps incomplete after {} packets",
                number,
                playback.pending.len()
            );
        }
    }

    fn begin_epoch(&mut self, playback: &mut FilePlayback) {
        let epoch = self.channel.begin_epoch();
        playback.epoch = epoch;
        playback.stats.epoch = epoch;

        let audio_output = self.channel.layout().and_then(|layout| layout.audio);
        for kind in [MediaKind::Video, MediaKind::Audio] {
            let Some(encoder) = self.encoders.get_mut(kind) else {
                continue;
            };
            let Some(track) = playback.track_mut(kind) else {
                continue;
            };
            let encoder_tb = encoder.time_base();
            track.epoch_start_out = rescale(track.start_pts.unwrap_or(0), track.time_base, encoder_tb);

            let required = encoder.frame_size();
            track.rechunk = false;
            if let (MediaKind::Audio, Some(output)) = (kind, audio_output) {
                if required != 0 && required != track.decoder.frame_size() {
                    self.encoders
                        .audio_fifo
                        .get_or_insert_with(|| {
                            AudioFifo::new(output.channels, output.sample_rate, encoder_tb)
                        })
                        .reset();
                    track.rechunk = true;
                }
            }
            debug!(
                "ch{}: epoch {} {} start {:?} (out {}), fifo {}",
                self.channel.number(),
                epoch,
                kind,
                track.start_pts,
                track.epoch_start_out,
                track.rechunk
            );
        }

        self.pacer = playback
            .video
            .as_ref()
            .map(|track| RealtimePacer::new(track.time_base, self.settings.resync_threshold));
    }

    fn process(&mut self, playback: &mut FilePlayback) {
        let number = self.channel.number();
        while !self.channel.is_cancelled() {
            let packet = match playback.next_packet() {
                Ok(packet) => packet,
                Err(CodecError::Eof) => break,
                Err(CodecError::Again) => continue,
                Err(CodecError::InvalidData(reason)) => {
                    playback.stats.decode_errors += 1;
                    warn!("ch{}: Skipping unreadable packet: {}", number, reason);
                    continue;
                }
                Err(e) => {
                    warn!("ch{}: Read failed: {}", number, e);
                    break;
                }
            };
            playback.stats.packets_read += 1;

            let Some(kind) = playback.kind_of(packet.stream_index) else {
                continue;
            };
            self.wait_for_demand();
            if kind == MediaKind::Video {
                self.pace(&packet, &mut playback.stats);
            }
            self.decode(playback, kind, Some(&packet));
        }
    }

    /// 按需频道在没有客户端时等待
    fn wait_for_demand(&mut self) {
        if !self.settings.on_demand || self.channel.active_clients() > 0 {
            return;
        }

        let mut polls = 0;
        while self.channel.active_clients() == 0 {
            if polls >= self.settings.demand_max_polls {
                warn!(
                    "ch{}: Excessive wait for connection writing.",
                    self.channel.number()
                );
                break;
            }
            if !sleep_cancellable(self.settings.demand_poll_interval, self.channel.cancel_token()) {
                return;
            }
            polls += 1;
        }
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.reset();
        }
    }

    /// 有客户端连接过之后，视频按实时节奏处理
    fn pace(&mut self, packet: &Packet, stats: &mut FileStats) {
        if !self.channel.ever_connected() {
            return;
        }
        let (Some(pacer), Some(pts)) = (self.pacer.as_mut(), packet.pts) else {
            return;
        };
        match pacer.pace(pts, Instant::now()) {
            PaceDecision::Proceed => {}
            PaceDecision::Sleep(wait) => {
                sleep_cancellable(wait, self.channel.cancel_token());
            }
            PaceDecision::Reanchored => stats.reanchors += 1,
        }
    }

    /// 送一个包（`None` 为冲刷）到解码器，并把得到的帧编码
    fn decode(&mut self, playback: &mut FilePlayback, kind: MediaKind, packet: Option<&Packet>) {
        let number = self.channel.number();
        let epoch = playback.epoch;
        let FilePlayback {
            video,
            audio,
            stats,
            ..
        } = playback;
        let Some(track) = (match kind {
            MediaKind::Video => video.as_mut(),
            MediaKind::Audio => audio.as_mut(),
        }) else {
            return;
        };

        match track.decoder.send_packet(packet) {
            Ok(()) | Err(CodecError::Again) | Err(CodecError::Eof) => {}
            Err(CodecError::InvalidData(reason)) => {
                stats.decode_errors += 1;
                warn!(
                    "ch{}: Send ignoring packet stream {} with invalid data: {}",
                    number, track.stream_index, reason
                );
                return;
            }
            Err(e) => {
                stats.decode_errors += 1;
                warn!("ch{}: Error sending packet to {} decoder: {}", number, kind, e);
                return;
            }
        }

        loop {
            match track.decoder.receive_frame() {
                Ok(frame) => encode_frame(&mut self.encoders, &self.channel, track, epoch, frame, stats),
                Err(CodecError::Again) | Err(CodecError::Eof) => break,
                Err(e) => {
                    stats.decode_errors += 1;
                    warn!("ch{}: Error receiving {} frame: {}", number, kind, e);
                    break;
                }
            }
        }
    }
}

/// 把一帧换算到编码器时间基后编码；音频需要时先经过 FIFO 重新切分
fn encode_frame(
    encoders: &mut OutputEncoders,
    channel: &ChannelShared,
    track: &mut Track,
    epoch: u64,
    frame: Frame,
    stats: &mut FileStats,
) {
    let OutputEncoders {
        video,
        audio,
        audio_fifo,
        ..
    } = encoders;
    let (encoder, fifo) = match track.kind {
        MediaKind::Video => (video.as_deref_mut(), None),
        MediaKind::Audio => (
            audio.as_deref_mut(),
            audio_fifo.as_mut().filter(|_| track.rechunk),
        ),
    };
    let Some(encoder) = encoder else {
        return;
    };
    let encoder_tb = encoder.time_base();
    let frame = Frame {
        pts: frame.pts.map(|pts| rescale(pts, track.time_base, encoder_tb)),
        dts: frame.dts.map(|dts| rescale(dts, track.time_base, encoder_tb)),
        duration: rescale(frame.duration, track.time_base, encoder_tb),
        ..frame
    };
    let meta = SlotMeta {
        time_base: encoder_tb,
        epoch,
        epoch_start_pts: track.epoch_start_out,
    };

    match fifo {
        Some(fifo) => {
            if let Err(e) = fifo.write(&frame) {
                stats.encode_errors += 1;
                warn!("ch{}: Audio fifo rejected frame: {}", channel.number(), e);
                return;
            }
            let frame_size = encoder.frame_size();
            while let Some(chunk) = fifo.read_frame(frame_size) {
                send_frame(encoder, channel, meta, &chunk, stats);
            }
        }
        None => send_frame(encoder, channel, meta, &frame, stats),
    }
}

fn send_frame(
    encoder: &mut dyn Encoder,
    channel: &ChannelShared,
    meta: SlotMeta,
    frame: &Frame,
    stats: &mut FileStats,
) {
    match encoder.send_frame(Some(frame)) {
        Ok(()) | Err(CodecError::Again) => {}
        Err(e) => {
            stats.encode_errors += 1;
            warn!(
                "ch{}: Error sending {} frame to encoder: {}",
                channel.number(),
                frame.kind,
                e
            );
            return;
        }
    }

    loop {
        match encoder.receive_packet() {
            Ok(packet) => {
                // 部分文件以负时间戳开始
                if packet.pts > 0 {
                    channel.ring().append(packet, meta);
                    stats.packets_appended += 1;
                }
            }
            Err(CodecError::Again) | Err(CodecError::Eof) => break,
            Err(e) => {
                stats.encode_errors += 1;
                warn!("ch{}: Error receiving encoded packet: {}", channel.number(), e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::playlist::DirectoryPlaylist;
    use crate::codec::SyntheticBackend;
    use common::SortMode;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn write_clip(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    fn settings(on_demand: bool) -> PipelineSettings {
        PipelineSettings {
            video_codec: VideoCodec::Mpeg2,
            probe_packet_limit: 100,
            resync_threshold: Duration::from_secs(1),
            on_demand,
            demand_poll_interval: Duration::from_millis(1),
            demand_max_polls: 3,
            playlist_retry: BackoffPolicy {
                retry_strategy: RetryStrategy::LinearBackoff,
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(20),
            },
        }
    }

    fn pipeline_with(
        dir: &TempDir,
        backend: SyntheticBackend,
        settings: PipelineSettings,
    ) -> (Pipeline, Arc<ChannelShared>) {
        let channel = Arc::new(ChannelShared::new(3, "Three".into(), 1024, CancellationToken::new()));
        let playlist = DirectoryPlaylist::new(dir.path(), SortMode::Alpha, &["mkv".to_string()]);
        let pipeline = Pipeline::new(
            channel.clone(),
            Arc::new(backend),
            Box::new(playlist),
            settings,
            None,
        );
        (pipeline, channel)
    }

    fn ring_packets(channel: &ChannelShared, kind: MediaKind) -> Vec<common::EncodedPacket> {
        let ring = channel.ring();
        (0..ring.capacity())
            .filter_map(|index| ring.read_at(index, 0))
            .filter(|slot| slot.packet.kind == kind)
            .map(|slot| slot.packet)
            .collect()
    }

    #[test]
    fn test_cycle_advances_epoch_per_file() {
        let dir = tempfile::tempdir().unwrap();
        write_clip(dir.path(), "a.mkv", "duration_ms = 400\n");
        write_clip(dir.path(), "b.mkv", "duration_ms = 400\nstart_ms = 5000\n");
        let (mut pipeline, channel) = pipeline_with(&dir, SyntheticBackend::new(), settings(false));

        assert_eq!(pipeline.play_cycle(), 2);
        assert_eq!(channel.epoch(), 2);
        assert_eq!(channel.status(), ChannelStatus::Playing);

        let layout = channel.layout().unwrap();
        assert!(layout.video.is_some());
        assert_eq!(layout.audio.unwrap().frame_size, AC3_FRAME_SIZE);
        assert!(channel.ring().last_written_sequence() > 0);

        assert_eq!(pipeline.play_cycle(), 2);
        assert_eq!(channel.epoch(), 4);
    }

    #[test]
    fn test_unreadable_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_clip(dir.path(), "a.mkv", "duration_ms = [\n");
        write_clip(dir.path(), "b.mkv", "duration_ms = 200\n");
        let (mut pipeline, channel) = pipeline_with(&dir, SyntheticBackend::new(), settings(false));

        assert_eq!(pipeline.play_cycle(), 1);
        assert_eq!(channel.epoch(), 1);
        assert!(!channel.is_faulted());
    }

    #[test]
    fn test_encoder_failure_faults_channel() {
        let dir = tempfile::tempdir().unwrap();
        write_clip(dir.path(), "a.mkv", "duration_ms = 200\n");
        let (pipeline, channel) =
            pipeline_with(&dir, SyntheticBackend::with_failing_encoders(), settings(false));

        let handle = std::thread::spawn(move || pipeline.run());
        handle.join().unwrap();

        assert!(channel.is_faulted());
        assert_eq!(channel.epoch(), 0);
        assert!(channel.layout().is_none());
    }

    #[test]
    fn test_audio_is_rechunked_to_encoder_frame_size() {
        let dir = tempfile::tempdir().unwrap();
        write_clip(dir.path(), "a.mkv", "duration_ms = 1000\naudio_frame_size = 1024\n");
        let (mut pipeline, channel) = pipeline_with(&dir, SyntheticBackend::new(), settings(false));

        assert_eq!(pipeline.play_cycle(), 1);

        // 47 x 1024 = 48128 个采样 -> 31 个完整的 1536 帧
        let audio = ring_packets(&channel, MediaKind::Audio);
        assert_eq!(audio.len(), 31);
        for pair in audio.windows(2) {
            assert_eq!(pair[1].pts - pair[0].pts, 1536);
        }
        assert!(audio.iter().all(|packet| packet.duration == 1536));

        let video = ring_packets(&channel, MediaKind::Video);
        assert_eq!(video.len(), 25);
        assert!(video[0].is_keyframe);
    }

    #[test]
    fn test_audio_remainder_does_not_carry_into_next_file() {
        let dir = tempfile::tempdir().unwrap();
        // 每个文件 4 x 1024 = 4096 个采样 -> 2 个 1536 帧，余 1024
        write_clip(dir.path(), "a.mkv", "duration_ms = 80\naudio_frame_size = 1024\n");
        write_clip(dir.path(), "b.mkv", "duration_ms = 80\naudio_frame_size = 1024\n");
        let (mut pipeline, channel) = pipeline_with(&dir, SyntheticBackend::new(), settings(false));

        assert_eq!(pipeline.play_cycle(), 2);

        let audio = ring_packets(&channel, MediaKind::Audio);
        assert_eq!(audio.len(), 4);
        assert_eq!(audio[2].pts, audio[0].pts);
        assert_eq!(audio[3].pts - audio[2].pts, 1536);
    }

    #[test]
    fn test_corrupt_packets_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_clip(dir.path(), "a.mkv", "duration_ms = 1000\ncorrupt_every = 5\n");
        let (mut pipeline, channel) = pipeline_with(&dir, SyntheticBackend::new(), settings(false));

        let entry = PlaylistEntry::new(dir.path().join("a.mkv"));
        let stats = pipeline.play_file(&entry).unwrap();
        assert_eq!(stats.decode_errors, 4);
        assert_eq!(ring_packets(&channel, MediaKind::Video).len(), 21);
    }

    #[test]
    fn test_broken_audio_decoder_keeps_video() {
        let dir = tempfile::tempdir().unwrap();
        write_clip(dir.path(), "a.mkv", "duration_ms = 400\nbroken_audio_decoder = true\n");
        let (mut pipeline, channel) = pipeline_with(&dir, SyntheticBackend::new(), settings(false));

        assert_eq!(pipeline.play_cycle(), 1);
        let layout = channel.layout().unwrap();
        assert!(layout.video.is_some());
        assert!(layout.audio.is_none());
        assert!(ring_packets(&channel, MediaKind::Audio).is_empty());
        assert_eq!(ring_packets(&channel, MediaKind::Video).len(), 10);
    }

    #[test]
    fn test_later_file_without_video_stream_plays_audio() {
        let dir = tempfile::tempdir().unwrap();
        write_clip(dir.path(), "a.mkv", "duration_ms = 200\n");
        write_clip(dir.path(), "b.mkv", "duration_ms = 200\nvideo = false\n");
        let (mut pipeline, channel) = pipeline_with(&dir, SyntheticBackend::new(), settings(false));

        assert_eq!(pipeline.play_cycle(), 2);
        assert_eq!(channel.epoch(), 2);
    }

    #[test]
    fn test_paced_after_client_connects() {
        let dir = tempfile::tempdir().unwrap();
        write_clip(dir.path(), "a.mkv", "duration_ms = 300\naudio = false\n");
        write_clip(dir.path(), "b.mkv", "duration_ms = 300\naudio = false\n");
        let (mut pipeline, channel) = pipeline_with(&dir, SyntheticBackend::new(), settings(false));
        channel.client_connected();

        let started = Instant::now();
        assert_eq!(pipeline.play_cycle(), 2);
        // 每个文件 7 帧，首尾相差 240ms
        assert!(started.elapsed() >= Duration::from_millis(400), "{:?}", started.elapsed());
    }

    #[test]
    fn test_on_demand_without_clients_still_advances() {
        let dir = tempfile::tempdir().unwrap();
        write_clip(dir.path(), "a.mkv", "duration_ms = 200\naudio = false\n");
        let (mut pipeline, channel) = pipeline_with(&dir, SyntheticBackend::new(), settings(true));

        assert_eq!(pipeline.play_cycle(), 1);
        assert_eq!(ring_packets(&channel, MediaKind::Video).len(), 5);
        assert!(!channel.ever_connected());
    }

    #[test]
    fn test_empty_playlist_waits_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, channel) = pipeline_with(&dir, SyntheticBackend::new(), settings(false));

        let handle = std::thread::spawn(move || pipeline.run());
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(channel.status(), ChannelStatus::Idle);

        channel.cancel_token().cancel();
        handle.join().unwrap();
        assert_eq!(channel.epoch(), 0);
    }
}
