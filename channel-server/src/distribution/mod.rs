// 统一低延迟视频流传输系统 - 频道注册表

mod manager;

pub use manager::ChannelRegistry;
