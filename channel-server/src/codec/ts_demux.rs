// 统一低延迟视频流传输系统 - MPEG-TS 解复用器
//
// 解析 ffmpeg 输出的传输流：PAT/PMT 定位节目，按 PID 组装 PES，
// 提取 PTS/DTS 与随机访问标志（关键帧）。

use crate::mux::crc32_mpeg2;
use bytes::{Bytes, BytesMut};
use common::MediaKind;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use tracing::{debug, warn};

const TS_PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;

/// 节目中的一路基本流
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementaryStream {
    pub pid: u16,
    pub stream_type: u8,
    pub kind: MediaKind,
}

/// 一个完整的 PES 包
#[derive(Debug, Clone, PartialEq)]
pub struct DemuxedPes {
    pub pid: u16,
    pub kind: MediaKind,
    /// 90kHz
    pub pts: Option<i64>,
    /// 90kHz
    pub dts: Option<i64>,
    pub random_access: bool,
    pub data: Bytes,
}

#[derive(Default)]
struct PesAssembler {
    buffer: BytesMut,
    random_access: bool,
}

/// 流式 TS 解复用器
pub struct TsDemuxer<R> {
    reader: R,
    pmt_pid: Option<u16>,
    streams: Vec<ElementaryStream>,
    assemblers: HashMap<u16, PesAssembler>,
    ready: VecDeque<DemuxedPes>,
    eof: bool,
    resyncs: u64,
}

impl<R: Read> TsDemuxer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pmt_pid: None,
            streams: Vec::new(),
            assemblers: HashMap::new(),
            ready: VecDeque::new(),
            eof: false,
            resyncs: 0,
        }
    }

    /// 已发现的基本流（每种媒体类型只保留第一路）
    pub fn streams(&self) -> &[ElementaryStream] {
        &self.streams
    }

    /// 读取直到 PMT 被解析，或者流结束
    pub fn discover_streams(&mut self) -> io::Result<&[ElementaryStream]> {
        while self.streams.is_empty() && !self.eof {
            self.pump()?;
        }
        Ok(&self.streams)
    }

    /// 返回下一个完整 PES，流结束返回 `None`
    pub fn next_pes(&mut self) -> io::Result<Option<DemuxedPes>> {
        loop {
            if let Some(pes) = self.ready.pop_front() {
                return Ok(Some(pes));
            }
            if self.eof {
                return Ok(None);
            }
            self.pump()?;
        }
    }

    fn pump(&mut self) -> io::Result<()> {
        let mut packet = [0u8; TS_PACKET_SIZE];
        if !self.read_packet(&mut packet)? {
            self.eof = true;
            let pids: Vec<u16> = self.assemblers.keys().copied().collect();
            for pid in pids {
                self.finish_pes(pid);
            }
            return Ok(());
        }
        self.process_packet(&packet);
        Ok(())
    }

    /// 读取一个 188 字节的包，同步字节丢失时逐字节重新同步
    fn read_packet(&mut self, packet: &mut [u8; TS_PACKET_SIZE]) -> io::Result<bool> {
        if !read_full(&mut self.reader, &mut packet[..])? {
            return Ok(false);
        }
        while packet[0] != SYNC_BYTE {
            self.resyncs += 1;
            let next = packet[1..].iter().position(|&b| b == SYNC_BYTE);
            let shift = match next {
                Some(offset) => offset + 1,
                None => TS_PACKET_SIZE,
            };
            packet.copy_within(shift.., 0);
            if !read_full(&mut self.reader, &mut packet[TS_PACKET_SIZE - shift..])? {
                return Ok(false);
            }
            if self.resyncs % 100 == 1 {
                warn!("Transport stream lost sync, skipped {} bytes", shift);
            }
        }
        Ok(true)
    }

    fn process_packet(&mut self, packet: &[u8; TS_PACKET_SIZE]) {
        let unit_start = packet[1] & 0x40 != 0;
        let pid = (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16;
        let adaptation = (packet[3] >> 4) & 0x03;

        let mut offset = 4;
        let mut random_access = false;
        if adaptation & 0x02 != 0 {
            let length = packet[4] as usize;
            if length > 0 {
                random_access = packet[5] & 0x40 != 0;
            }
            offset = 5 + length;
        }
        if adaptation & 0x01 == 0 || offset >= TS_PACKET_SIZE {
            return;
        }
        let payload = &packet[offset..];

        if pid == 0 {
            if unit_start {
                self.parse_pat(payload);
            }
        } else if Some(pid) == self.pmt_pid {
            if unit_start {
                self.parse_pmt(payload);
            }
        } else if self.streams.iter().any(|stream| stream.pid == pid) {
            if unit_start {
                self.finish_pes(pid);
                let assembler = self.assemblers.entry(pid).or_default();
                assembler.buffer.extend_from_slice(payload);
                assembler.random_access = random_access;
            } else if let Some(assembler) = self.assemblers.get_mut(&pid) {
                assembler.buffer.extend_from_slice(payload);
            }
        }
    }

    fn parse_pat(&mut self, payload: &[u8]) {
        let Some(section) = psi_section(payload, 0x00) else {
            return;
        };
        let entries = &section[8..section.len() - 4];
        for entry in entries.chunks_exact(4) {
            let program = u16::from_be_bytes([entry[0], entry[1]]);
            let pid = (((entry[2] & 0x1F) as u16) << 8) | entry[3] as u16;
            if program != 0 {
                if self.pmt_pid != Some(pid) {
                    debug!("PAT: program {} on PMT PID {:#x}", program, pid);
                }
                self.pmt_pid = Some(pid);
                return;
            }
        }
    }

    fn parse_pmt(&mut self, payload: &[u8]) {
        if !self.streams.is_empty() {
            return;
        }
        let Some(section) = psi_section(payload, 0x02) else {
            return;
        };
        if section.len() < 16 {
            return;
        }
        let info_length = ((((section[10] & 0x0F) as usize) << 8) | section[11] as usize).min(section.len());
        let end = section.len() - 4;
        let mut pos = 12 + info_length;

        while pos + 5 <= end {
            let stream_type = section[pos];
            let pid = (((section[pos + 1] & 0x1F) as u16) << 8) | section[pos + 2] as u16;
            let es_info = (((section[pos + 3] & 0x0F) as usize) << 8) | section[pos + 4] as usize;
            pos += 5 + es_info;

            let Some(kind) = classify_stream_type(stream_type) else {
                continue;
            };
            if self.streams.iter().any(|stream| stream.kind == kind) {
                continue;
            }
            debug!("PMT: {} stream type {:#x} on PID {:#x}", kind, stream_type, pid);
            self.streams.push(ElementaryStream {
                pid,
                stream_type,
                kind,
            });
        }
    }

    fn finish_pes(&mut self, pid: u16) {
        let Some(assembler) = self.assemblers.remove(&pid) else {
            return;
        };
        let Some(kind) = self
            .streams
            .iter()
            .find(|stream| stream.pid == pid)
            .map(|stream| stream.kind)
        else {
            return;
        };
        match parse_pes(&assembler.buffer) {
            Some((pts, dts, data)) => self.ready.push_back(DemuxedPes {
                pid,
                kind,
                pts,
                dts,
                random_access: assembler.random_access,
                data: Bytes::copy_from_slice(data),
            }),
            None => debug!("Dropping malformed PES on PID {:#x}", pid),
        }
    }
}

/// 读满缓冲区，在读到任何数据前遇到流结束返回 `false`
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// 定位 PSI 段并校验表号与 CRC
fn psi_section(payload: &[u8], table_id: u8) -> Option<&[u8]> {
    let pointer = *payload.first()? as usize;
    let section = payload.get(1 + pointer..)?;
    if section.len() < 3 || section[0] != table_id {
        return None;
    }
    let length = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
    let section = section.get(..3 + length)?;
    if section.len() < 12 || crc32_mpeg2(section) != 0 {
        warn!("Discarding PSI table {:#x} with bad CRC", table_id);
        return None;
    }
    Some(section)
}

/// 根据 stream_type 判断媒体类型
pub fn classify_stream_type(stream_type: u8) -> Option<MediaKind> {
    match stream_type {
        0x01 | 0x02 | 0x10 | 0x1B | 0x24 => Some(MediaKind::Video),
        0x03 | 0x04 | 0x0F | 0x11 | 0x81 | 0x87 => Some(MediaKind::Audio),
        _ => None,
    }
}

fn parse_timestamp(bytes: &[u8]) -> i64 {
    (((bytes[0] >> 1) & 0x07) as i64) << 30
        | (bytes[1] as i64) << 22
        | ((bytes[2] >> 1) as i64) << 15
        | (bytes[3] as i64) << 7
        | (bytes[4] >> 1) as i64
}

/// 解析 PES 头，返回 (PTS, DTS, 负载)
fn parse_pes(buffer: &[u8]) -> Option<(Option<i64>, Option<i64>, &[u8])> {
    if buffer.len() < 9 || buffer[0..3] != [0x00, 0x00, 0x01] {
        return None;
    }
    let flags = buffer[7] >> 6;
    let header_length = buffer[8] as usize;
    let payload = buffer.get(9 + header_length..)?;

    let pts = if flags & 0x02 != 0 {
        buffer.get(9..14).map(parse_timestamp)
    } else {
        None
    };
    let dts = if flags == 0x03 {
        buffer.get(14..19).map(parse_timestamp)
    } else {
        pts
    };
    Some((pts, dts, payload))
}
