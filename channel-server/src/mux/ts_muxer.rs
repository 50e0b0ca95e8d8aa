// 统一低延迟视频流传输系统 - MPEG-TS 复用器实现
//
// 本模块实现了面向实时直播的传输流写入。
//
// # 特性
//
// - 生成 PAT/PMT（节目 1），视频关键帧前及每 400 个包重复一次
// - PES 携带 PTS/DTS，视频流承载 PCR
// - 关键帧置随机访问标志
// - 通过适配域填充，负载中不出现填充字节
// - 无需预知时长或长度，适合未知大小的流式输出

use crate::codec::OutputLayout;
use bytes::{BufMut, BytesMut};
use common::{EncodedPacket, MediaKind};
use tracing::debug;

pub const TS_PACKET_SIZE: usize = 188;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x100;
pub const AUDIO_PID: u16 = 0x101;
pub const PROGRAM_NUMBER: u16 = 1;

/// 复用延迟（0.7 秒，90kHz），PTS/DTS 相对 PCR 的提前量
pub const MUX_DELAY_TICKS: i64 = 63_000;

const PSI_REPEAT_PACKETS: u64 = 400;
const AC3_STREAM_TYPE: u8 = 0x81;
const TIMESTAMP_MASK: i64 = (1 << 33) - 1;

/// 计算 CRC-32/MPEG-2
///
/// 多项式 0x04C11DB7，初值 0xFFFFFFFF，不反射，无结果异或。
/// 对包含 CRC 字段的完整段计算结果为 0。
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[derive(Debug, Clone, Copy)]
struct EsTrack {
    pid: u16,
    stream_type: u8,
    stream_id: u8,
    continuity: u8,
}

impl EsTrack {
    fn next_continuity(&mut self) -> u8 {
        let current = self.continuity;
        self.continuity = (self.continuity + 1) & 0x0F;
        current
    }
}

/// 传输流复用器
///
/// 输入包的时间戳须为 90kHz。
pub struct TsMuxer {
    video: Option<EsTrack>,
    audio: Option<EsTrack>,
    pcr_pid: u16,
    pat_continuity: u8,
    pmt_continuity: u8,
    packets_since_psi: u64,
    packets_written: u64,
}

impl TsMuxer {
    /// 根据频道输出布局创建复用器
    pub fn new(layout: &OutputLayout) -> Self {
        let video = layout.video.map(|video| EsTrack {
            pid: VIDEO_PID,
            stream_type: video.codec.stream_type(),
            stream_id: 0xE0,
            continuity: 0,
        });
        let audio = layout.audio.map(|_| EsTrack {
            pid: AUDIO_PID,
            stream_type: AC3_STREAM_TYPE,
            stream_id: 0xBD,
            continuity: 0,
        });
        let pcr_pid = if video.is_some() { VIDEO_PID } else { AUDIO_PID };

        Self {
            video,
            audio,
            pcr_pid,
            pat_continuity: 0,
            pmt_continuity: 0,
            packets_since_psi: 0,
            packets_written: 0,
        }
    }

    /// 写入容器头（PAT + PMT）
    pub fn write_header(&mut self, out: &mut BytesMut) {
        self.write_psi(out);
    }

    /// 已写出的 TS 包数
    pub fn packets_written(&self) -> u64 {
        self.packets_written
    }

    /// 复用一个编码包
    ///
    /// 布局中不存在的媒体类型被忽略。
    pub fn write_packet(&mut self, packet: &EncodedPacket, out: &mut BytesMut) {
        let is_video = packet.kind == MediaKind::Video;
        if (is_video && self.video.is_none()) || (!is_video && self.audio.is_none()) {
            return;
        }

        if (is_video && packet.is_keyframe) || self.packets_since_psi >= PSI_REPEAT_PACKETS {
            self.write_psi(out);
        }

        let Some(mut track) = (if is_video { self.video } else { self.audio }) else {
            return;
        };

        let pts = (packet.pts + MUX_DELAY_TICKS).max(0) & TIMESTAMP_MASK;
        let dts = (packet.dts + MUX_DELAY_TICKS).max(0) & TIMESTAMP_MASK;
        let pes = build_pes(track.stream_id, pts, dts, &packet.data, is_video);

        let pcr = if track.pid == self.pcr_pid {
            Some(packet.dts.max(0) & TIMESTAMP_MASK)
        } else {
            None
        };

        let mut remaining: &[u8] = &pes;
        let mut first = true;
        while !remaining.is_empty() {
            let mut adaptation: Vec<u8> = Vec::new();
            if first && (pcr.is_some() || packet.is_keyframe) {
                let mut flags = 0u8;
                if packet.is_keyframe {
                    flags |= 0x40;
                }
                if pcr.is_some() {
                    flags |= 0x10;
                }
                adaptation.push(flags);
                if let Some(base) = pcr {
                    put_pcr(&mut adaptation, base);
                }
            }

            let header_room = if adaptation.is_empty() { 0 } else { 1 + adaptation.len() };
            let room = TS_PACKET_SIZE - 4 - header_room;
            let take = remaining.len().min(room);
            let stuffing = room - take;

            let has_adaptation = !adaptation.is_empty() || stuffing > 0;
            if stuffing > 0 {
                if adaptation.is_empty() {
                    if stuffing >= 2 {
                        adaptation.push(0x00);
                        adaptation.extend(std::iter::repeat(0xFF).take(stuffing - 2));
                    }
                } else {
                    adaptation.extend(std::iter::repeat(0xFF).take(stuffing));
                }
            }

            let control = if has_adaptation { 0x30 } else { 0x10 };
            out.put_u8(0x47);
            let unit_start: u8 = if first { 0x40 } else { 0x00 };
            out.put_u8(unit_start | ((track.pid >> 8) as u8 & 0x1F));
            out.put_u8(track.pid as u8);
            out.put_u8(control | track.next_continuity());
            if has_adaptation {
                out.put_u8(adaptation.len() as u8);
                out.put_slice(&adaptation);
            }
            out.put_slice(&remaining[..take]);

            remaining = &remaining[take..];
            first = false;
            self.packets_written += 1;
            self.packets_since_psi += 1;
        }

        if is_video {
            self.video = Some(track);
        } else {
            self.audio = Some(track);
        }
    }

    fn write_psi(&mut self, out: &mut BytesMut) {
        let pat = self.pat_section();
        let pmt = self.pmt_section();
        let pat_cc = self.pat_continuity;
        let pmt_cc = self.pmt_continuity;
        write_section_packet(out, 0x0000, pat_cc, &pat);
        write_section_packet(out, PMT_PID, pmt_cc, &pmt);
        self.pat_continuity = (pat_cc + 1) & 0x0F;
        self.pmt_continuity = (pmt_cc + 1) & 0x0F;
        self.packets_written += 2;
        self.packets_since_psi = 0;
        debug!("Wrote PSI tables ({} packets so far)", self.packets_written);
    }

    fn pat_section(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(16);
        body.extend_from_slice(&1u16.to_be_bytes()); // transport_stream_id
        body.extend_from_slice(&[0xC1, 0x00, 0x00]);
        body.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
        body.extend_from_slice(&(0xE000 | PMT_PID).to_be_bytes());
        finish_section(0x00, body)
    }

    fn pmt_section(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(32);
        body.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
        body.extend_from_slice(&[0xC1, 0x00, 0x00]);
        body.extend_from_slice(&(0xE000 | self.pcr_pid).to_be_bytes());
        body.extend_from_slice(&0xF000u16.to_be_bytes());

        if let Some(video) = self.video {
            body.push(video.stream_type);
            body.extend_from_slice(&(0xE000 | video.pid).to_be_bytes());
            body.extend_from_slice(&0xF000u16.to_be_bytes());
        }
        if let Some(audio) = self.audio {
            // registration_descriptor 'AC-3'
            let descriptor = [0x05, 0x04, b'A', b'C', b'-', b'3'];
            body.push(audio.stream_type);
            body.extend_from_slice(&(0xE000 | audio.pid).to_be_bytes());
            body.extend_from_slice(&(0xF000 | descriptor.len() as u16).to_be_bytes());
            body.extend_from_slice(&descriptor);
        }
        finish_section(0x02, body)
    }
}

/// 补全段头与 CRC
fn finish_section(table_id: u8, body: Vec<u8>) -> Vec<u8> {
    let length = body.len() + 4;
    let mut section = Vec::with_capacity(3 + length);
    section.push(table_id);
    section.push(0xB0 | ((length >> 8) as u8 & 0x0F));
    section.push(length as u8);
    section.extend_from_slice(&body);
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}

fn write_section_packet(out: &mut BytesMut, pid: u16, continuity: u8, section: &[u8]) {
    out.put_u8(0x47);
    out.put_u8(0x40 | ((pid >> 8) as u8 & 0x1F));
    out.put_u8(pid as u8);
    out.put_u8(0x10 | (continuity & 0x0F));
    out.put_u8(0x00); // pointer_field
    out.put_slice(section);
    let used = 5 + section.len();
    out.put_bytes(0xFF, TS_PACKET_SIZE.saturating_sub(used));
}

fn put_timestamp(out: &mut Vec<u8>, prefix: u8, value: i64) {
    out.push((prefix << 4) | ((((value >> 30) & 0x07) as u8) << 1) | 0x01);
    out.push((value >> 22) as u8);
    out.push((((value >> 15) as u8) << 1) | 0x01);
    out.push((value >> 7) as u8);
    out.push(((value as u8) << 1) | 0x01);
}

fn put_pcr(out: &mut Vec<u8>, base: i64) {
    let extension: u16 = 0;
    out.push((base >> 25) as u8);
    out.push((base >> 17) as u8);
    out.push((base >> 9) as u8);
    out.push((base >> 1) as u8);
    out.push((((base & 0x01) as u8) << 7) | 0x7E | ((extension >> 8) as u8 & 0x01));
    out.push(extension as u8);
}

fn build_pes(stream_id: u8, pts: i64, dts: i64, payload: &[u8], unbounded: bool) -> Vec<u8> {
    let with_dts = dts != pts;
    let header_data_length: usize = if with_dts { 10 } else { 5 };
    let pes_length = 3 + header_data_length + payload.len();
    let length_field = if unbounded || pes_length > u16::MAX as usize {
        0
    } else {
        pes_length as u16
    };

    let mut pes = Vec::with_capacity(9 + header_data_length + payload.len());
    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    pes.extend_from_slice(&length_field.to_be_bytes());
    pes.push(0x84); // data_alignment_indicator
    pes.push(if with_dts { 0xC0 } else { 0x80 });
    pes.push(header_data_length as u8);
    if with_dts {
        put_timestamp(&mut pes, 0x03, pts);
        put_timestamp(&mut pes, 0x01, dts);
    } else {
        put_timestamp(&mut pes, 0x02, pts);
    }
    pes.extend_from_slice(payload);
    pes
}
