// 统一低延迟视频流传输系统 - 包环形缓冲区
//
// 一个写者（频道流水线）、多个读者（客户端会话）的有界交接区。

mod ring;

pub use ring::{CursorRead, PacketSlot, ReadCursor, RingBuffer, SlotMeta, WaitOutcome};
