// 统一低延迟视频流传输系统 - 频道
//
// 一个频道 = 播放列表 + 流水线（独立线程）+ 环形缓冲区 + 若干客户端会话。
// `ChannelShared` 是流水线线程与所有会话之间唯一共享的状态。

pub mod guide;
pub mod pacer;
pub mod pipeline;
pub mod playlist;

use crate::buffer::RingBuffer;
use crate::codec::OutputLayout;
use crate::error::SessionError;
use common::{ChannelInfo, ChannelStatus};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use pipeline::{Pipeline, PipelineSettings};
pub use playlist::DirectoryPlaylist;

const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SLEEP_SLICE: Duration = Duration::from_millis(20);

struct ChannelState {
    status: ChannelStatus,
    now_playing: Option<String>,
}

/// 频道共享状态
pub struct ChannelShared {
    number: u32,
    name: String,
    ring: RingBuffer,
    /// 输出编码器参数，会话启动时读取
    layout: Mutex<Option<OutputLayout>>,
    state: Mutex<ChannelState>,
    epoch: AtomicU64,
    active_clients: AtomicUsize,
    ever_connected: AtomicBool,
    cancel: CancellationToken,
}

impl ChannelShared {
    pub fn new(number: u32, name: String, capacity: usize, cancel: CancellationToken) -> Self {
        Self {
            number,
            name,
            ring: RingBuffer::new(capacity),
            layout: Mutex::new(None),
            state: Mutex::new(ChannelState {
                status: ChannelStatus::Starting,
                now_playing: None,
            }),
            epoch: AtomicU64::new(0),
            active_clients: AtomicUsize::new(0),
            ever_connected: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 发布输出布局（只在首个文件打开编码器后调用一次）
    pub fn publish_layout(&self, layout: OutputLayout) {
        *self.layout.lock() = Some(layout);
    }

    pub fn layout(&self) -> Option<OutputLayout> {
        *self.layout.lock()
    }

    pub fn status(&self) -> ChannelStatus {
        self.state.lock().status
    }

    pub fn set_status(&self, status: ChannelStatus) {
        let mut state = self.state.lock();
        if state.status != ChannelStatus::Faulted {
            state.status = status;
        }
    }

    pub fn set_now_playing(&self, title: Option<String>) {
        self.state.lock().now_playing = title;
    }

    /// 标记频道故障：拒绝新会话，流水线退出
    pub fn fault(&self, reason: &str) {
        error!("ch{}: channel faulted: {}", self.number, reason);
        let mut state = self.state.lock();
        state.status = ChannelStatus::Faulted;
        state.now_playing = None;
    }

    pub fn is_faulted(&self) -> bool {
        self.status() == ChannelStatus::Faulted
    }

    /// 开始新的文件代，返回新代号
    pub fn begin_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn client_connected(&self) -> usize {
        self.ever_connected.store(true, Ordering::SeqCst);
        let count = self.active_clients.fetch_add(1, Ordering::SeqCst) + 1;
        info!("ch{}: client connected ({} active)", self.number, count);
        count
    }

    pub fn client_disconnected(&self) -> usize {
        let previous = self
            .active_clients
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        let count = previous.saturating_sub(1);
        info!("ch{}: client disconnected ({} active)", self.number, count);
        count
    }

    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::SeqCst)
    }

    /// 是否曾有客户端连接过（决定流水线是否按实时节奏运行）
    pub fn ever_connected(&self) -> bool {
        self.ever_connected.load(Ordering::SeqCst)
    }

    /// 等待频道产生输出布局
    ///
    /// # 返回
    ///
    /// 布局就绪返回布局；频道故障、超时或关闭时返回对应错误
    pub async fn wait_for_output(&self, timeout: Duration) -> Result<OutputLayout, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            if self.is_faulted() {
                return Err(SessionError::ChannelFaulted(self.number));
            }
            if let Some(layout) = self.layout() {
                return Ok(layout);
            }
            if Instant::now() >= deadline {
                return Err(SessionError::NotReady(self.number));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = tokio::time::sleep(OUTPUT_POLL_INTERVAL) => {}
            }
        }
    }

    pub fn info(&self) -> ChannelInfo {
        let state = self.state.lock();
        ChannelInfo {
            number: self.number,
            name: self.name.clone(),
            status: state.status,
            now_playing: state.now_playing.clone(),
            epoch: self.epoch(),
            active_clients: self.active_clients(),
            last_sequence: self.ring.last_written_sequence(),
        }
    }
}

/// 在独立线程上运行频道流水线
pub fn spawn_pipeline(pipeline: Pipeline) -> std::io::Result<JoinHandle<()>> {
    let name = format!("ch{}", pipeline.channel_number());
    std::thread::Builder::new()
        .name(name)
        .spawn(move || pipeline.run())
}

/// 可取消的阻塞睡眠（流水线线程使用）
///
/// # 返回
///
/// 睡满返回 `true`，被取消返回 `false`
pub(crate) fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
