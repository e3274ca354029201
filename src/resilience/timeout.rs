//! 超时控制实现
//!
//! 提供上游连接超时、流读取空闲超时与整体流超时

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// 超时配置
///
/// 所有字段为 0 表示不启用对应超时
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// 上游连接（收到响应头之前）超时（毫秒）
    pub request_timeout_ms: u64,
    /// 两行之间的最长间隔（毫秒）
    pub read_idle_timeout_ms: u64,
    /// 整个流的最长持续时间（毫秒）
    pub stream_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            read_idle_timeout_ms: 30_000,
            stream_timeout_ms: 600_000,
        }
    }
}

fn non_zero(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl TimeoutConfig {
    pub fn new(request_timeout_ms: u64, read_idle_timeout_ms: u64, stream_timeout_ms: u64) -> Self {
        Self {
            request_timeout_ms,
            read_idle_timeout_ms,
            stream_timeout_ms,
        }
    }

    /// 创建无超时的配置
    pub fn no_timeout() -> Self {
        Self::new(0, 0, 0)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        non_zero(self.request_timeout_ms)
    }

    pub fn read_idle_timeout(&self) -> Option<Duration> {
        non_zero(self.read_idle_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Option<Duration> {
        non_zero(self.stream_timeout_ms)
    }
}

/// 超时错误
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimeoutError {
    /// 连接超时
    #[error("请求超时: 配置 {timeout_ms}ms, 已耗时 {elapsed_ms}ms")]
    RequestTimeout { timeout_ms: u64, elapsed_ms: u64 },
    /// 读取空闲超时
    #[error("流式响应空闲超时: 配置 {timeout_ms}ms")]
    ReadIdleTimeout { timeout_ms: u64 },
    /// 整体流超时
    #[error("流式响应总时长超时: 配置 {timeout_ms}ms")]
    StreamTimeout { timeout_ms: u64 },
    /// 操作被取消
    #[error("操作已取消")]
    Cancelled,
}

/// 超时控制器
#[derive(Debug, Clone, Default)]
pub struct TimeoutController {
    config: TimeoutConfig,
}

impl TimeoutController {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// 整体流的截止时刻
    pub fn stream_deadline(&self, started: Instant) -> Option<Instant> {
        self.config.stream_timeout().map(|d| started + d)
    }

    /// 带超时执行异步操作
    pub async fn execute_with_timeout<F, T>(&self, operation: F) -> Result<T, TimeoutError>
    where
        F: Future<Output = T>,
    {
        let start = Instant::now();

        match self.config.request_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, operation)
                .await
                .map_err(|_| TimeoutError::RequestTimeout {
                    timeout_ms: self.config.request_timeout_ms,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                }),
            None => Ok(operation.await),
        }
    }

    /// 带超时和取消执行异步操作
    pub async fn execute_with_timeout_and_cancel<F, T>(
        &self,
        operation: F,
        cancel_token: &CancellationToken,
    ) -> Result<T, TimeoutError>
    where
        F: Future<Output = T>,
    {
        if cancel_token.is_cancelled() {
            return Err(TimeoutError::Cancelled);
        }

        tokio::select! {
            result = self.execute_with_timeout(operation) => result,
            _ = cancel_token.cancelled() => Err(TimeoutError::Cancelled),
        }
    }
}
