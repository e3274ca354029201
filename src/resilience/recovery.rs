//! 错误恢复管理
//!
//! 将失败归类为错误类型，并结合熔断器状态与重试预算选择恢复动作。

use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::retry::{RetryConfig, RetryError, RetryExecutor, Retryable};
use crate::stream::events::{MalformedReason, UpstreamErrorPayload};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// 错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 数据行无法解码
    MalformedJson,
    /// 解码成功但结构不符合预期
    InvalidChunk,
    /// 读取空闲超时
    NetworkTimeout,
    /// 传输层读取失败
    ConnectionLost,
    /// 上游过载 / 限流 / 5xx
    UpstreamOverload,
    /// 上游拒绝请求（4xx，重试无意义）
    UpstreamRejected,
}

impl ErrorKind {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorKind::ConnectionLost | ErrorKind::UpstreamRejected)
    }

    /// 是否反映上游健康状况，计入熔断器
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTimeout | ErrorKind::ConnectionLost | ErrorKind::UpstreamOverload
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::MalformedJson => "malformed_json",
            ErrorKind::InvalidChunk => "invalid_chunk",
            ErrorKind::NetworkTimeout => "network_timeout",
            ErrorKind::ConnectionLost => "connection_lost",
            ErrorKind::UpstreamOverload => "upstream_overload",
            ErrorKind::UpstreamRejected => "upstream_rejected",
        };
        f.write_str(s)
    }
}

/// 恢复动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// 跳过当前单元，保持状态
    Continue,
    /// 退避后重试
    Retry,
    /// 关闭重复检测，原样透传
    Degrade,
    /// 终止会话
    Terminate,
}

/// 一次错误的归类结果
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub recoverable: bool,
    pub suggested_action: RecoveryAction,
    pub detail: String,
}

/// 流处理中出现的失败
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFailure {
    /// 无法解析的数据行
    Malformed {
        raw: String,
        error: String,
        reason: MalformedReason,
    },
    /// 超过空闲时间没有收到数据
    ReadTimeout { idle: Duration },
    /// 读取上游时的传输错误
    Transport(String),
    /// 上游在流内返回的错误
    Upstream(UpstreamErrorPayload),
}

impl fmt::Display for StreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamFailure::Malformed { error, .. } => write!(f, "无效数据行: {}", error),
            StreamFailure::ReadTimeout { idle } => {
                write!(f, "读取空闲超时: {}ms", idle.as_millis())
            }
            StreamFailure::Transport(e) => write!(f, "传输错误: {}", e),
            StreamFailure::Upstream(payload) => match payload.status {
                Some(status) => write!(f, "上游错误 ({}): {}", status, payload.message),
                None => write!(f, "上游错误: {}", payload.message),
            },
        }
    }
}

/// 熔断器打开时强制执行的动作
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenBreakerAction {
    #[default]
    Terminate,
    Degrade,
}

impl From<OpenBreakerAction> for RecoveryAction {
    fn from(action: OpenBreakerAction) -> Self {
        match action {
            OpenBreakerAction::Terminate => RecoveryAction::Terminate,
            OpenBreakerAction::Degrade => RecoveryAction::Degrade,
        }
    }
}

/// 恢复策略
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// 熔断器打开时的动作
    pub open_breaker_action: OpenBreakerAction,
    /// 连接中断时是否重试
    pub retry_connection_lost: bool,
}

impl RecoveryPolicy {
    /// 错误类型对应的默认动作
    pub fn default_action(&self, kind: ErrorKind) -> RecoveryAction {
        match kind {
            ErrorKind::MalformedJson | ErrorKind::InvalidChunk => RecoveryAction::Continue,
            ErrorKind::NetworkTimeout | ErrorKind::UpstreamOverload => RecoveryAction::Retry,
            ErrorKind::ConnectionLost if self.retry_connection_lost => RecoveryAction::Retry,
            ErrorKind::ConnectionLost | ErrorKind::UpstreamRejected => RecoveryAction::Terminate,
        }
    }

    /// 该类型的错误是否值得重试
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.default_action(kind) == RecoveryAction::Retry
    }
}

/// 受熔断器保护的操作错误
#[derive(Debug, Error)]
pub enum GuardedError<E> {
    /// 熔断器拒绝了本次尝试
    #[error("熔断器已打开，拒绝请求")]
    CircuitOpen,
    /// 操作本身失败
    #[error("{0}")]
    Operation(E),
}

impl<E: Retryable> Retryable for GuardedError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            GuardedError::CircuitOpen => false,
            GuardedError::Operation(e) => e.is_retryable(),
        }
    }

    fn trips_breaker(&self) -> bool {
        match self {
            GuardedError::CircuitOpen => false,
            GuardedError::Operation(e) => e.trips_breaker(),
        }
    }
}

/// 错误恢复管理器
///
/// 每个会话一个实例，熔断器按上游目标共享
#[derive(Debug, Clone)]
pub struct ErrorRecoveryManager {
    policy: RecoveryPolicy,
    retry: RetryExecutor,
    breaker: Arc<CircuitBreaker>,
}

impl ErrorRecoveryManager {
    pub fn new(policy: RecoveryPolicy, retry: RetryConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            policy,
            retry: RetryExecutor::new(retry),
            breaker,
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry_config(&self) -> &RetryConfig {
        self.retry.config()
    }

    /// 归类失败
    pub fn classify(&self, failure: &StreamFailure) -> ErrorRecord {
        let kind = match failure {
            StreamFailure::Malformed { reason, .. } => match reason {
                MalformedReason::InvalidShape => ErrorKind::InvalidChunk,
                MalformedReason::InvalidJson | MalformedReason::MissingDataMarker => {
                    ErrorKind::MalformedJson
                }
            },
            StreamFailure::ReadTimeout { .. } => ErrorKind::NetworkTimeout,
            StreamFailure::Transport(_) => ErrorKind::ConnectionLost,
            StreamFailure::Upstream(payload) => {
                if payload.is_overload() {
                    ErrorKind::UpstreamOverload
                } else {
                    ErrorKind::UpstreamRejected
                }
            }
        };

        ErrorRecord {
            kind,
            recoverable: kind.is_recoverable(),
            suggested_action: self.policy.default_action(kind),
            detail: failure.to_string(),
        }
    }

    /// 选择恢复动作
    ///
    /// `attempt` 为本次故障之前已经执行过的重试次数
    pub fn decide(&self, record: &ErrorRecord, attempt: u32) -> RecoveryAction {
        if self.breaker.is_open() {
            return self.policy.open_breaker_action.into();
        }

        match record.suggested_action {
            RecoveryAction::Retry => {
                if attempt < self.retry.config().max_retries && self.breaker.allow() {
                    RecoveryAction::Retry
                } else {
                    RecoveryAction::Terminate
                }
            }
            other => other,
        }
    }

    /// 归类、上报熔断器并选择动作
    pub fn handle(&self, failure: &StreamFailure, attempt: u32) -> (ErrorRecord, RecoveryAction) {
        let record = self.classify(failure);
        if record.kind.trips_breaker() {
            self.breaker.record_failure();
        }
        let action = self.decide(&record, attempt);

        tracing::warn!(
            kind = %record.kind,
            attempt,
            "[Recovery] {} -> {:?}",
            record.detail,
            action
        );
        (record, action)
    }

    /// 第 N 次重试前的等待时间
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.retry.backoff_delay(attempt)
    }

    pub fn report_success(&self) {
        self.breaker.record_success();
    }

    pub fn report_failure(&self) {
        self.breaker.record_failure();
    }

    /// 在熔断器保护下带重试执行操作
    ///
    /// 每次尝试前检查熔断器，每次结果都会上报
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        mut operation: F,
    ) -> Result<T, RetryError<GuardedError<E>>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let breaker = &self.breaker;
        self.retry
            .execute(|| {
                let attempt = breaker.allow().then(&mut operation);
                async move {
                    let Some(fut) = attempt else {
                        return Err(GuardedError::CircuitOpen);
                    };
                    match fut.await {
                        Ok(value) => {
                            breaker.record_success();
                            Ok(value)
                        }
                        Err(e) => {
                            if e.trips_breaker() {
                                breaker.record_failure();
                            }
                            Err(GuardedError::Operation(e))
                        }
                    }
                }
            })
            .await
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitState};

    fn manager(max_failures: u32) -> ErrorRecoveryManager {
        let breaker = Arc::new(CircuitBreaker::new(
            "t",
            CircuitBreakerConfig {
                max_failures,
                reset_timeout_ms: 60_000,
                ..Default::default()
            },
        ));
        ErrorRecoveryManager::new(
            RecoveryPolicy::default(),
            RetryConfig {
                jitter_ratio: 0.0,
                ..RetryConfig::new(2, 1, 5)
            },
            breaker,
        )
    }

    fn malformed(reason: MalformedReason) -> StreamFailure {
        StreamFailure::Malformed {
            raw: "data: {".to_string(),
            error: "EOF".to_string(),
            reason,
        }
    }

    #[test]
    fn test_classify_table() {
        let m = manager(5);
        let cases = [
            (malformed(MalformedReason::InvalidJson), ErrorKind::MalformedJson, RecoveryAction::Continue),
            (malformed(MalformedReason::InvalidShape), ErrorKind::InvalidChunk, RecoveryAction::Continue),
            (
                StreamFailure::ReadTimeout { idle: Duration::from_secs(1) },
                ErrorKind::NetworkTimeout,
                RecoveryAction::Retry,
            ),
            (StreamFailure::Transport("reset".into()), ErrorKind::ConnectionLost, RecoveryAction::Terminate),
            (
                StreamFailure::Upstream(UpstreamErrorPayload {
                    status: Some(529),
                    error_type: Some("overloaded_error".into()),
                    message: "Overloaded".into(),
                }),
                ErrorKind::UpstreamOverload,
                RecoveryAction::Retry,
            ),
            (
                StreamFailure::Upstream(UpstreamErrorPayload {
                    status: Some(400),
                    error_type: None,
                    message: "bad request".into(),
                }),
                ErrorKind::UpstreamRejected,
                RecoveryAction::Terminate,
            ),
        ];

        for (failure, kind, action) in cases {
            let record = m.classify(&failure);
            assert_eq!(record.kind, kind);
            assert_eq!(record.suggested_action, action);
            assert_eq!(record.recoverable, kind.is_recoverable());
        }
    }

    #[test]
    fn test_connection_lost_policy() {
        let policy = RecoveryPolicy {
            retry_connection_lost: true,
            ..Default::default()
        };
        assert_eq!(policy.default_action(ErrorKind::ConnectionLost), RecoveryAction::Retry);
        assert!(!RecoveryPolicy::default().is_retryable(ErrorKind::ConnectionLost));
    }

    #[test]
    fn test_retry_bounded_by_budget() {
        let m = manager(100);
        let failure = StreamFailure::ReadTimeout {
            idle: Duration::from_millis(10),
        };
        assert_eq!(m.handle(&failure, 0).1, RecoveryAction::Retry);
        assert_eq!(m.handle(&failure, 1).1, RecoveryAction::Retry);
        assert_eq!(m.handle(&failure, 2).1, RecoveryAction::Terminate);
    }

    #[test]
    fn test_malformed_does_not_trip_breaker() {
        let m = manager(1);
        for _ in 0..5 {
            let (_, action) = m.handle(&malformed(MalformedReason::InvalidJson), 0);
            assert_eq!(action, RecoveryAction::Continue);
        }
        assert_eq!(m.breaker().state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_breaker_forces_configured_action() {
        let m = manager(2);
        let failure = StreamFailure::ReadTimeout {
            idle: Duration::from_millis(10),
        };
        m.handle(&failure, 0);
        let (_, action) = m.handle(&failure, 0);
        assert!(m.breaker().is_open());
        assert_eq!(action, RecoveryAction::Terminate);

        // 熔断器打开后即使是可跳过的错误也执行强制动作
        let (_, action) = m.handle(&malformed(MalformedReason::InvalidJson), 0);
        assert_eq!(action, RecoveryAction::Terminate);

        let degrade = ErrorRecoveryManager::new(
            RecoveryPolicy {
                open_breaker_action: OpenBreakerAction::Degrade,
                ..Default::default()
            },
            RetryConfig::default(),
            m.breaker().clone(),
        );
        assert_eq!(degrade.handle(&failure, 0).1, RecoveryAction::Degrade);
    }

    #[derive(Debug)]
    struct Flaky(bool);

    impl fmt::Display for Flaky {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "flaky(retryable={})", self.0)
        }
    }

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn test_execute_with_retry_reports_outcomes() {
        let m = manager(10);
        let mut calls = 0u32;

        let result = m
            .execute_with_retry(|| {
                calls += 1;
                let n = calls;
                async move {
                    if n < 3 {
                        Err(Flaky(true))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        // 成功后失败计数归零
        assert_eq!(m.breaker().snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_execute_with_retry_stops_when_breaker_opens() {
        let m = manager(2);
        let mut calls = 0u32;

        let result: Result<(), _> = m
            .execute_with_retry(|| {
                calls += 1;
                async { Err(Flaky(true)) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err.last_error, GuardedError::CircuitOpen));
        assert_eq!(calls, 2);
        assert!(m.breaker().is_open());
    }

    #[tokio::test]
    async fn test_execute_with_retry_non_retryable() {
        let m = manager(10);
        let result: Result<(), _> = m.execute_with_retry(|| async { Err(Flaky(false)) }).await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.last_error, GuardedError::Operation(Flaky(false))));
    }
}
