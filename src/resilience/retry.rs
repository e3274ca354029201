//! 重试机制实现
//!
//! 提供带指数退避和抖动的重试逻辑

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// 可重试的 HTTP 状态码
pub const RETRYABLE_STATUS_CODES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大重试次数（不含首次尝试）
    pub max_retries: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 退避倍数
    pub backoff_factor: f64,
    /// 抖动比例，抖动为计算延迟的 [0, ratio) 倍
    pub jitter_ratio: f64,
    /// 可重试的状态码
    pub retryable_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_factor: 2.0,
            jitter_ratio: 0.2,
            retryable_codes: RETRYABLE_STATUS_CODES.to_vec(),
        }
    }
}

impl RetryConfig {
    /// 创建新的重试配置
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            ..Default::default()
        }
    }

    /// 检查状态码是否可重试
    pub fn is_retryable(&self, status_code: u16) -> bool {
        self.retryable_codes.contains(&status_code)
    }
}

/// 可参与重试判定的错误
pub trait Retryable {
    /// 是否值得重试
    fn is_retryable(&self) -> bool;

    /// 是否计入熔断器的失败次数
    fn trips_breaker(&self) -> bool {
        true
    }
}

/// 重试耗尽
#[derive(Debug, Error)]
#[error("重试耗尽: 尝试 {attempts} 次后失败 - {last_error}")]
pub struct RetryError<E: fmt::Display> {
    /// 尝试次数（包括初始请求）
    pub attempts: u32,
    /// 最后一次错误
    pub last_error: E,
}

impl<E: fmt::Display> RetryError<E> {
    pub fn into_inner(self) -> E {
        self.last_error
    }
}

/// 重试执行器
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryExecutor {
    /// 创建新的重试执行器
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// 获取配置
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 计算第 N 次重试的退避时间（指数退避 + 抖动）
    ///
    /// 公式: min(base * factor^attempt, max) + jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor: f64 = rand::thread_rng().gen_range(0.0..1.0);
        self.backoff_delay_with_jitter(attempt, factor)
    }

    /// 计算退避时间（可指定抖动因子，用于测试）
    ///
    /// jitter_factor 应在 [0.0, 1.0) 范围内
    pub fn backoff_delay_with_jitter(&self, attempt: u32, jitter_factor: f64) -> Duration {
        let base = self.config.base_delay_ms as f64;
        let max = self.config.max_delay_ms as f64;
        let factor = self.config.backoff_factor.max(1.0);

        let exponential = base * factor.powi(attempt.min(i32::MAX as u32) as i32);
        let capped = if exponential.is_finite() {
            exponential.min(max)
        } else {
            max
        };

        let jitter = capped * self.config.jitter_ratio.max(0.0) * jitter_factor.clamp(0.0, 1.0);

        Duration::from_millis((capped + jitter) as u64)
    }

    /// 同步计算重试序列的所有退避时间（用于测试）
    pub fn compute_backoff_sequence(&self, jitter_factor: f64) -> Vec<Duration> {
        (0..self.config.max_retries)
            .map(|attempt| self.backoff_delay_with_jitter(attempt, jitter_factor))
            .collect()
    }

    /// 带重试执行异步操作
    ///
    /// 不可重试的错误在首次失败后直接返回
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            match operation().await {
                Ok(result) => {
                    if attempts > 1 {
                        tracing::info!("[Retry] 第 {} 次尝试成功", attempts);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !error.is_retryable() || attempts > self.config.max_retries {
                        return Err(RetryError {
                            attempts,
                            last_error: error,
                        });
                    }

                    let delay = self.backoff_delay(attempts - 1);
                    tracing::warn!(
                        "[Retry] 第 {} 次尝试失败: {}，{}ms 后重试",
                        attempts,
                        error,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
