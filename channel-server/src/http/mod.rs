// 统一低延迟视频流传输系统 - HTTP 层

mod handlers;
mod routes;
mod server;
mod streaming;

use crate::config::SessionConfig;
use crate::distribution::ChannelRegistry;
use std::time::Duration;

pub use server::HttpServer;

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub registry: ChannelRegistry,
    pub session: SessionConfig,
    /// 频道尚无输出时，新连接最多等待这么久
    pub ready_timeout: Duration,
}

impl AppState {
    pub fn new(registry: ChannelRegistry, session: SessionConfig, ready_timeout: Duration) -> Self {
        Self {
            registry,
            session,
            ready_timeout,
        }
    }
}
