// 统一低延迟视频流传输系统 - 频道服务器入口

mod buffer;
mod channel;
mod codec;
mod config;
mod distribution;
mod error;
mod http;
mod mux;

use anyhow::{Context, Result};
use channel::guide::GuideNotifier;
use channel::{ChannelShared, DirectoryPlaylist, Pipeline, PipelineSettings};
use clap::Parser;
use codec::{FfmpegBackend, MediaBackend, SyntheticBackend};
use config::{BackendKind, Config};
use distribution::ChannelRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 新连接等待频道首个输出的最长时间
const CLIENT_READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "restream", about = "Loops media directories into live MPEG-TS channels")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "restream.toml")]
    config: PathBuf,

    /// 日志级别（覆盖配置文件，RUST_LOG 优先）
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(cli_level: Option<&str>, config_level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cli_level.or(config_level).unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn create_backend(config: &Config) -> Arc<dyn MediaBackend> {
    match config.media.backend {
        BackendKind::Ffmpeg => Arc::new(FfmpegBackend::new(
            config.media.ffmpeg_path.clone(),
            config.media.ffprobe_path.clone(),
        )),
        BackendKind::Synthetic => Arc::new(SyntheticBackend::new()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 先加载配置，日志级别可能来自配置文件
    let loaded = Config::load(&cli.config);
    init_logging(
        cli.log_level.as_deref(),
        loaded.as_ref().ok().map(|c| c.log_level.as_str()),
    );

    info!("🚀 Channel server starting...");

    let config = loaded.with_context(|| format!("loading {}", cli.config.display()))?;
    info!("✓ Configuration loaded from {}", cli.config.display());

    let backend = create_backend(&config);
    info!("✓ Media backend: {:?}", config.media.backend);

    let shutdown = CancellationToken::new();
    let registry = ChannelRegistry::new();
    let mut workers = Vec::with_capacity(config.channels.len());

    for channel_config in &config.channels {
        let channel = Arc::new(ChannelShared::new(
            channel_config.number,
            channel_config.display_name(),
            config.media.buffer_capacity,
            shutdown.child_token(),
        ));

        let playlist = DirectoryPlaylist::new(
            channel_config.dir.clone(),
            channel_config.sort,
            &config.media.extensions,
        );
        let guide = (config.guide.enabled && channel_config.guide).then(|| {
            GuideNotifier::new(
                config.guide.socket.clone(),
                channel_config.number,
                channel_config.display_name(),
            )
        });
        let pipeline = Pipeline::new(
            channel.clone(),
            backend.clone(),
            Box::new(playlist),
            PipelineSettings::new(&config.media, channel_config),
            guide,
        );

        let handle = channel::spawn_pipeline(pipeline)
            .with_context(|| format!("spawning pipeline for channel {}", channel_config.number))?;
        workers.push((channel_config.number, handle));
        registry.register(channel);

        info!(
            "✓ Channel {} ({}) serving {}",
            channel_config.number,
            channel_config.display_name(),
            channel_config.dir.display()
        );
    }

    let addr = config
        .listen_addr()
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen_addr()))?;
    let state = http::AppState::new(registry.clone(), config.session.clone(), CLIENT_READY_TIMEOUT);
    let server = http::HttpServer::new(addr, state);

    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(server_shutdown.clone()).await {
            error!("HTTP server error: {}", e);
            server_shutdown.cancel();
        }
    });

    info!("✅ Channel server ready! {} channel(s)", registry.len());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Cannot listen for shutdown signal: {}", e);
            }
            info!("🛑 Shutdown requested");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    if let Err(e) = server_handle.await {
        error!("HTTP server task failed: {}", e);
    }

    tokio::task::spawn_blocking(move || {
        for (number, handle) in workers {
            if handle.join().is_err() {
                warn!("ch{}: pipeline thread panicked", number);
            }
        }
    })
    .await?;

    for info in registry.list() {
        info!(
            "ch{}: stopped at epoch {} (last seq {})",
            info.number, info.epoch, info.last_sequence
        );
    }

    info!("👋 Channel server stopped");
    Ok(())
}
