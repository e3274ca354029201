//! 容错机制属性测试
//!
//! 使用 proptest 进行属性测试

use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig, RetryExecutor, Retryable,
};
use proptest::prelude::*;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 带状态码的测试错误
#[derive(Debug)]
struct StatusError(u16);

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.0)
    }
}

impl Retryable for StatusError {
    fn is_retryable(&self) -> bool {
        RetryConfig::default().is_retryable(self.0)
    }
}

/// 生成有效的重试配置（用于属性测试，使用较短的延迟）
fn arb_retry_config() -> impl Strategy<Value = RetryConfig> {
    (
        1u32..=5u32,    // max_retries
        1u64..=5u64,    // base_delay_ms
        5u64..=20u64,   // max_delay_ms
        1.0f64..=3.0f64, // backoff_factor
        0.0f64..=0.5f64, // jitter_ratio
    )
        .prop_map(
            |(max_retries, base_delay_ms, max_delay_ms, backoff_factor, jitter_ratio)| RetryConfig {
                backoff_factor,
                jitter_ratio,
                ..RetryConfig::new(max_retries, base_delay_ms, max_delay_ms.max(base_delay_ms))
            },
        )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

/// 执行一个按调用序号决定结果的操作，返回结果与实际调用次数
fn run_counted<F>(executor: &RetryExecutor, outcome: F) -> (Result<u32, u32>, u32)
where
    F: Fn(u32) -> Result<u32, StatusError>,
{
    let rt = runtime();
    rt.block_on(async {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = executor
            .execute(|| {
                let current = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let result = outcome(current);
                async move { result }
            })
            .await
            .map_err(|e| e.attempts);

        (result, attempts.load(Ordering::SeqCst))
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// **Property: 重试次数限制**
    /// *对于任意* 持续失败的可重试操作，尝试次数应为 1 + max_retries
    #[test]
    fn prop_retry_count_limit(config in arb_retry_config()) {
        let max_retries = config.max_retries;
        let executor = RetryExecutor::new(config);

        let (result, actual_attempts) = run_counted(&executor, |_| Err(StatusError(503)));

        prop_assert!(result.is_err(), "持续失败的操作应该返回错误");
        let expected_attempts = 1 + max_retries;
        prop_assert_eq!(
            actual_attempts,
            expected_attempts,
            "尝试次数应为 {} (1 + {}), 但实际为 {}",
            expected_attempts,
            max_retries,
            actual_attempts
        );
        prop_assert_eq!(result.unwrap_err(), expected_attempts, "错误中的尝试次数不正确");
    }

    /// **Property: 重试次数限制（成功提前终止）**
    /// *对于任意* 请求，如果在重试过程中成功，应立即返回而不继续重试
    #[test]
    fn prop_retry_stops_on_success(
        config in arb_retry_config(),
        success_at in 1u32..=10u32
    ) {
        let success_at = success_at.min(config.max_retries + 1);
        let executor = RetryExecutor::new(config);

        let (result, actual_attempts) = run_counted(&executor, |n| {
            if n >= success_at { Ok(n) } else { Err(StatusError(429)) }
        });

        prop_assert_eq!(result, Ok(success_at), "应该在第 {} 次尝试时成功", success_at);
        prop_assert_eq!(actual_attempts, success_at);
    }

    /// **Property: 不可重试错误只尝试一次**
    #[test]
    fn prop_no_retry_on_non_retryable_error(
        config in arb_retry_config(),
        status_code in prop::sample::select(vec![400u16, 401, 403, 404, 405, 422])
    ) {
        let executor = RetryExecutor::new(config);

        let (result, actual_attempts) = run_counted(&executor, |_| Err(StatusError(status_code)));

        prop_assert!(result.is_err(), "不可重试的错误应该返回错误");
        prop_assert_eq!(
            actual_attempts,
            1,
            "不可重试的错误应该只尝试 1 次，但实际尝试了 {} 次",
            actual_attempts
        );
    }
}

proptest! {
    /// **Property: 退避时间单调不减且不超过上限**
    /// *对于任意* 重试配置，无抖动时退避序列单调不减且每项不超过 max_delay
    #[test]
    fn prop_backoff_non_decreasing_and_capped(config in arb_retry_config()) {
        let max_delay = Duration::from_millis(config.max_delay_ms);
        let executor = RetryExecutor::new(config);

        let sequence = executor.compute_backoff_sequence(0.0);
        prop_assert!(!sequence.is_empty(), "退避序列不应为空");

        for (i, delay) in sequence.iter().enumerate() {
            prop_assert!(
                *delay <= max_delay,
                "第 {} 次退避时间 {:?} 不应超过最大值 {:?}",
                i,
                delay,
                max_delay
            );
        }
        for i in 1..sequence.len() {
            prop_assert!(
                sequence[i] >= sequence[i - 1],
                "第 {} 次退避时间 {:?} 应 >= 第 {} 次 {:?}",
                i,
                sequence[i],
                i - 1,
                sequence[i - 1]
            );
        }
    }

    /// **Property: 抖动范围**
    /// *对于任意* 抖动因子，增加的延迟不超过计算延迟的 jitter_ratio 倍
    #[test]
    fn prop_backoff_jitter_range(
        config in arb_retry_config(),
        attempt in 0u32..=8u32,
        jitter_factor in 0.0f64..1.0f64
    ) {
        let ratio = config.jitter_ratio;
        let executor = RetryExecutor::new(config);

        let base = executor.backoff_delay_with_jitter(attempt, 0.0);
        let jittered = executor.backoff_delay_with_jitter(attempt, jitter_factor);

        prop_assert!(jittered >= base, "抖动不应减少延迟");
        let max_jitter = base.as_secs_f64() * ratio + 0.002;
        prop_assert!(
            (jittered - base).as_secs_f64() <= max_jitter,
            "抖动 {:?} 超过了 {:.3}s",
            jittered - base,
            max_jitter
        );
    }
}

/// 生成熔断器配置（冷却时间很短）
fn arb_breaker_config() -> impl Strategy<Value = CircuitBreakerConfig> {
    (1u32..=6u32, 1u32..=4u32, 1u32..=4u32).prop_map(|(max_failures, trials, successes)| {
        CircuitBreakerConfig {
            max_failures,
            reset_timeout_ms: 5,
            half_open_max_trials: trials,
            half_open_success_threshold: successes,
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// **Property: 熔断器完整周期**
    /// *对于任意* 配置，max_failures 次连续失败后拒绝请求；冷却后进入半开，
    /// 恰好放行试探名额；达到成功阈值后关闭
    #[test]
    fn prop_breaker_full_cycle(config in arb_breaker_config()) {
        let breaker = CircuitBreaker::new("prop", config.clone());

        for i in 0..config.max_failures {
            prop_assert!(breaker.allow(), "第 {} 次失败之前应允许请求", i + 1);
            breaker.record_failure();
        }
        prop_assert_eq!(breaker.state(), CircuitState::Open);
        prop_assert!(!breaker.allow(), "熔断器打开后应拒绝请求");

        std::thread::sleep(Duration::from_millis(10));
        prop_assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let granted = (0..config.trial_budget() + 2).filter(|_| breaker.allow()).count() as u32;
        prop_assert_eq!(granted, config.trial_budget(), "半开状态应恰好放行试探名额");

        for _ in 0..config.success_threshold() {
            prop_assert_ne!(breaker.state(), CircuitState::Closed);
            breaker.record_success();
        }
        prop_assert_eq!(breaker.state(), CircuitState::Closed);
        prop_assert!(breaker.allow());
    }

    /// **Property: 状态转换不跳过半开**
    /// *对于任意* 失败/成功序列，转换日志中不存在 Open -> Closed 的直接跳转（除手动重置外）
    #[test]
    fn prop_breaker_never_skips_half_open(
        config in arb_breaker_config(),
        outcomes in prop::collection::vec(any::<bool>(), 1..40)
    ) {
        let breaker = CircuitBreaker::new("prop", config);

        for (i, ok) in outcomes.iter().enumerate() {
            if i % 8 == 7 {
                std::thread::sleep(Duration::from_millis(6));
            }
            if breaker.allow() {
                if *ok { breaker.record_success() } else { breaker.record_failure() }
            }
        }

        for t in breaker.transitions() {
            prop_assert!(
                !(t.from == CircuitState::Open && t.to == CircuitState::Closed),
                "不应从 Open 直接转换到 Closed: {:?}",
                t
            );
            prop_assert!(
                !(t.from == CircuitState::Closed && t.to == CircuitState::HalfOpen),
                "不应从 Closed 直接转换到 HalfOpen: {:?}",
                t
            );
        }
    }
}
