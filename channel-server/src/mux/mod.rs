// 统一低延迟视频流传输系统 - 客户端复用模块
//
// 本模块负责把频道环形缓冲区中的编码包变成每个客户端独立的传输流字节：
//
// - `timeline`: 时间戳重定基
// - `ts_muxer`: MPEG-TS 复用
// - `session`: 客户端会话（读游标 + 重定基 + 复用 + 字节缓冲）

pub mod session;
pub mod timeline;
pub mod ts_muxer;

pub use session::{ClientSession, Pull};
pub use ts_muxer::crc32_mpeg2;
