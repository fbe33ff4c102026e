mod audio;
mod config;
mod encoder;
mod error;
mod server;
mod session;

use anyhow::{Context, Result};
use local_ip_address::local_ip;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::audio::{CpalCatalog, Platform};
use crate::config::Config;
use crate::encoder::{EncoderSettings, locate_encoder};
use crate::server::AppState;
use crate::session::SessionContext;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志，默认 info，可用 RUST_LOG 覆盖
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 加载配置：编译期默认值 -> 配置文件 -> LOOPCAST_* 环境变量
    let config = Config::load()?;
    config.validate()?;

    // 采集源只在启动时解析一次，失败即退出
    let resolved = audio::resolve(&config.capture_config(), Platform::current(), &CpalCatalog::new())
        .context("No usable audio source")?;

    let program = locate_encoder(config.encoder_path.as_deref());
    log::info!("Encoder: {}", program.display());

    let context = SessionContext {
        capture: audio::source_for(&resolved),
        encoder: EncoderSettings {
            program,
            format: config.pcm_format(),
            bitrate_kbps: config.bitrate_kbps,
        },
        config: config.session_config(),
    };

    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    // 启动横幅：局域网地址、采集方式和设置提示
    let host = match local_ip() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            log::warn!("Could not determine local IP: {}", e);
            "localhost".to_string()
        }
    };
    log::info!(
        "{} {} streaming at http://{}:{}{}",
        env!("APP_NAME"),
        env!("APP_VERSION"),
        host,
        config.port,
        config.stream_path
    );
    log::info!("Capture: {} (mode {})", resolved.label, config.audio_mode);
    log::info!(
        "Format: {} Hz, {} ch, {} kbps MP3",
        config.sample_rate,
        config.channels,
        config.bitrate_kbps
    );
    if !resolved.setup_hint.is_empty() {
        log::info!("Setup: {}", resolved.setup_hint);
    }

    // Ctrl+C 取消所有会话并停止服务
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("Received Ctrl+C, shutting down...");
                    shutdown.cancel();
                }
                Err(e) => log::warn!("Ctrl+C handler unavailable: {}", e),
            }
        }
    });

    server::serve(listener, &config.stream_path, AppState::new(context, shutdown)).await?;
    log::info!("Server stopped");
    Ok(())
}
