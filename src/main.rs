use anyhow::{Context, Result};
use relaycast::config::RelayConfig;
use relaycast::server::{self, AppState};
use std::path::PathBuf;

/// 初始化日志，`RUST_LOG` 优先于配置文件
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("relaycast={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => RelayConfig::default_path()?,
    };
    let config = RelayConfig::load_or_default(&path)
        .with_context(|| format!("加载配置失败: {}", path.display()))?;

    init_logging(&config.logging.level);
    tracing::info!(
        "[Main] relaycast v{} 启动，上游 {} 个",
        env!("CARGO_PKG_VERSION"),
        config.upstreams.len()
    );

    let state = AppState::new(config)?;
    server::serve(state).await.context("HTTP 服务异常退出")?;
    Ok(())
}
