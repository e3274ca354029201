//! HTTP 服务
//!
//! 提供 OpenAI 兼容的 `/v1/chat/completions` 透传接口与 `/health` 健康检查。

pub mod handlers;

use crate::config::RelayConfig;
use crate::processor::RelayError;
use crate::resilience::CircuitBreakerRegistry;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;

/// 所有请求共享的状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub client: reqwest::Client,
    /// 按上游目标共享的熔断器
    pub registry: Arc<CircuitBreakerRegistry>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::Internal(format!("创建 HTTP 客户端失败: {}", e)))?;
        let registry = CircuitBreakerRegistry::new(config.stream.breaker.clone());
        Ok(Self {
            config: Arc::new(config),
            client,
            registry: Arc::new(registry),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .with_state(state)
}

/// 在已绑定的监听器上提供服务
pub async fn serve_with_listener(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("[Server] 监听 http://{}", addr);
    }
    axum::serve(listener, build_router(state)).await
}

/// 按配置绑定地址并提供服务
pub async fn serve(state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(state.config.server.addr()).await?;
    serve_with_listener(listener, state).await
}
