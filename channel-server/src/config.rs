// 统一低延迟视频流传输系统 - 配置加载
//
// 服务器从 TOML 文件读取配置，所有字段均有默认值。

use crate::error::{BackoffPolicy, RetryStrategy};
use common::{SortMode, VideoCodec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub guide: GuideConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// 编解码后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 调用 ffmpeg/ffprobe 命令行
    #[default]
    Ffmpeg,
    /// 内置合成源（无需 ffmpeg）
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    /// 环形缓冲区槽位数
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// 探测起始时间戳时最多读取的包数
    #[serde(default = "default_probe_packet_limit")]
    pub probe_packet_limit: usize,
    /// 节奏控制失步阈值（毫秒）
    #[serde(default = "default_resync_threshold_ms")]
    pub resync_threshold_ms: u64,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 一轮等待中的最大轮询次数
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// 单次 HTTP 拉取的最大字节数
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuideConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_guide_socket")]
    pub socket: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub number: u32,
    #[serde(default)]
    pub name: Option<String>,
    pub dir: PathBuf,
    #[serde(default)]
    pub sort: SortMode,
    #[serde(default)]
    pub encoder: VideoCodec,
    #[serde(default = "default_true")]
    pub guide: bool,
    #[serde(default)]
    pub on_demand: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8100
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_buffer_capacity() -> usize {
    180
}

fn default_probe_packet_limit() -> usize {
    100
}

fn default_resync_threshold_ms() -> u64 {
    1000
}

fn default_extensions() -> Vec<String> {
    vec!["mkv".to_string(), "mp4".to_string()]
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_max_polls() -> u32 {
    1000
}

fn default_backoff_step_ms() -> u64 {
    10
}

fn default_backoff_max_ms() -> u64 {
    250
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_guide_socket() -> PathBuf {
    PathBuf::from("/var/lib/tvheadend/epggrab/xmltv.sock")
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            buffer_capacity: default_buffer_capacity(),
            probe_packet_limit: default_probe_packet_limit(),
            resync_threshold_ms: default_resync_threshold_ms(),
            extensions: default_extensions(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
            backoff_step_ms: default_backoff_step_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket: default_guide_socket(),
        }
    }
}

impl Config {
    /// 从文件加载并校验配置
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 从 TOML 文本解析并校验配置
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::Invalid("at least one channel is required".into()));
        }

        let mut numbers = HashSet::new();
        for channel in &self.channels {
            if !numbers.insert(channel.number) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate channel number {}",
                    channel.number
                )));
            }
        }

        if self.media.buffer_capacity < 2 {
            return Err(ConfigError::Invalid(format!(
                "buffer_capacity must be at least 2, got {}",
                self.media.buffer_capacity
            )));
        }

        if self.media.extensions.is_empty() {
            return Err(ConfigError::Invalid("extensions must not be empty".into()));
        }

        if self.session.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl MediaConfig {
    pub fn resync_threshold(&self) -> Duration {
        Duration::from_millis(self.resync_threshold_ms)
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// 数据饥饿时轮询间隔的放宽策略（线性，有上限）
    pub fn starvation_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            retry_strategy: RetryStrategy::LinearBackoff,
            backoff_base: Duration::from_millis(self.backoff_step_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms.max(self.poll_interval_ms)),
        }
    }
}

impl ChannelConfig {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Channel {}", self.number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
            [[channels]]
            number = 1
            dir = "/srv/media/ch1"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8100);
        assert_eq!(config.media.buffer_capacity, 180);
        assert_eq!(config.media.probe_packet_limit, 100);
        assert_eq!(config.media.backend, BackendKind::Ffmpeg);
        assert_eq!(config.channels[0].sort, SortMode::Alpha);
        assert_eq!(config.channels[0].encoder, VideoCodec::Mpeg2);
        assert!(config.channels[0].guide);
        assert!(!config.guide.enabled);
        assert_eq!(config.channels[0].display_name(), "Channel 1");
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_toml_str(
            r#"
            log_level = "debug"

            [server]
            host = "127.0.0.1"
            port = 9000

            [media]
            backend = "synthetic"
            buffer_capacity = 64
            extensions = ["mkv", "mp4", "ts"]

            [session]
            poll_interval_ms = 5
            backoff_max_ms = 100

            [guide]
            enabled = true
            socket = "/tmp/xmltv.sock"

            [[channels]]
            number = 2
            name = "Movies"
            dir = "/srv/movies"
            sort = "random"
            encoder = "h264"
            on_demand = true
            "#,
        )
        .unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:9000");
        assert_eq!(config.media.backend, BackendKind::Synthetic);
        assert_eq!(config.media.extensions.len(), 3);
        assert_eq!(config.session.poll_interval(), Duration::from_millis(5));
        let channel = &config.channels[0];
        assert_eq!(channel.display_name(), "Movies");
        assert_eq!(channel.sort, SortMode::Random);
        assert_eq!(channel.encoder, VideoCodec::H264);
        assert!(channel.on_demand);
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            Config::from_toml_str(""),
            Err(ConfigError::Invalid(_))
        ));

        let duplicate = r#"
            [[channels]]
            number = 1
            dir = "/a"
            [[channels]]
            number = 1
            dir = "/b"
        "#;
        assert!(matches!(
            Config::from_toml_str(duplicate),
            Err(ConfigError::Invalid(_))
        ));

        let tiny = r#"
            [media]
            buffer_capacity = 1
            [[channels]]
            number = 1
            dir = "/a"
        "#;
        assert!(matches!(
            Config::from_toml_str(tiny),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            Config::from_toml_str("[[channels]\nnumber ="),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restream.toml");
        std::fs::write(&path, "[[channels]]\nnumber = 7\ndir = \"/media\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.channels[0].number, 7);

        assert!(matches!(
            Config::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_starvation_policy_is_linear_and_capped() {
        let session = SessionConfig::default();
        let policy = session.starvation_policy();
        assert_eq!(policy.retry_strategy, RetryStrategy::LinearBackoff);
        assert_eq!(policy.calculate_delay(1000), Duration::from_millis(250));
    }
}
