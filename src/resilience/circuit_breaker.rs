//! 熔断器
//!
//! 按上游目标隔离故障：连续失败达到阈值后打开，冷却期结束后进入半开状态，
//! 半开期间只放行有限的试探请求。

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 转换日志保留的最大条数
const MAX_TRANSITIONS: usize = 32;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// 熔断器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// 打开熔断器所需的连续失败次数
    pub max_failures: u32,
    /// 冷却时间（毫秒）
    pub reset_timeout_ms: u64,
    /// 半开状态允许的试探次数
    pub half_open_max_trials: u32,
    /// 半开状态关闭熔断器所需的连续成功次数
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout_ms: 30_000,
            half_open_max_trials: 3,
            half_open_success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// 试探次数，至少为 1
    pub fn trial_budget(&self) -> u32 {
        self.half_open_max_trials.max(1)
    }

    /// 关闭所需成功次数，不超过试探次数
    pub fn success_threshold(&self) -> u32 {
        self.half_open_success_threshold.clamp(1, self.trial_budget())
    }
}

/// 一次状态转换
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerTransition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// 熔断器状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_trials: u32,
    pub half_open_successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    /// 进入当前状态的时刻（Open 的冷却、HalfOpen 的试探周期都以此计时）
    entered_at: Instant,
    half_open_trials: u32,
    half_open_successes: u32,
    transitions: VecDeque<BreakerTransition>,
}

/// 熔断器
///
/// 内部状态由互斥锁保护，可在多个会话间共享
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                entered_at: Instant::now(),
                half_open_trials: 0,
                half_open_successes: 0,
                transitions: VecDeque::new(),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// 是否允许发起一次操作
    ///
    /// 半开状态下每次返回 true 都会占用一个试探名额
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_trials >= self.config.trial_budget()
                    && now.duration_since(inner.entered_at) >= self.config.reset_timeout()
                {
                    // 试探结果迟迟未回报，重新发放名额
                    inner.half_open_trials = 0;
                    inner.half_open_successes = 0;
                    inner.entered_at = now;
                }
                if inner.half_open_trials < self.config.trial_budget() {
                    inner.half_open_trials += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// 记录一次成功
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());

        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold() {
                    let reason = format!("半开状态连续成功 {} 次", inner.half_open_successes);
                    self.transition(&mut inner, CircuitState::Closed, reason);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// 记录一次失败
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.max_failures.max(1) {
                    let reason = format!("连续失败 {} 次", inner.failure_count);
                    self.transition(&mut inner, CircuitState::Open, reason);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open, "半开状态试探失败".to_string());
            }
            CircuitState::Open => {}
        }
    }

    /// 当前状态
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// 状态与计数快照
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        BreakerSnapshot {
            target: self.target.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_trials: inner.half_open_trials,
            half_open_successes: inner.half_open_successes,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// 最近的状态转换（旧的在前）
    pub fn transitions(&self) -> Vec<BreakerTransition> {
        self.inner.lock().transitions.iter().cloned().collect()
    }

    /// 强制关闭
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, "手动重置".to_string());
        }
        inner.failure_count = 0;
    }

    /// 冷却期结束后 Open -> HalfOpen
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open
            && now.duration_since(inner.entered_at) >= self.config.reset_timeout()
        {
            self.transition(inner, CircuitState::HalfOpen, "冷却时间结束".to_string());
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, reason: String) {
        let from = inner.state;
        inner.state = to;
        inner.entered_at = Instant::now();
        inner.half_open_trials = 0;
        inner.half_open_successes = 0;
        if to == CircuitState::Closed {
            inner.failure_count = 0;
        }

        match to {
            CircuitState::Open => tracing::warn!(
                target_key = %self.target,
                "[CircuitBreaker] {} -> {}: {}",
                from,
                to,
                reason
            ),
            _ => tracing::info!(
                target_key = %self.target,
                "[CircuitBreaker] {} -> {}: {}",
                from,
                to,
                reason
            ),
        }

        if inner.transitions.len() >= MAX_TRANSITIONS {
            inner.transitions.pop_front();
        }
        inner.transitions.push_back(BreakerTransition {
            from,
            to,
            reason,
            at: Utc::now(),
        });
    }
}

/// 按上游目标划分的熔断器注册表
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// 获取或创建指定目标的熔断器
    pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return existing.clone();
        }
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())))
            .clone()
    }

    /// 按上游 URL 获取熔断器
    pub fn for_url(&self, url: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(&Self::target_key(url))
    }

    /// 目标键: `host:port`，无法解析时使用原始字符串
    pub fn target_key(url: &str) -> String {
        match url::Url::parse(url) {
            Ok(parsed) => match (parsed.host_str(), parsed.port_or_known_default()) {
                (Some(host), Some(port)) => format!("{}:{}", host, port),
                (Some(host), None) => host.to_string(),
                _ => url.to_string(),
            },
            Err(_) => url.to_string(),
        }
    }

    /// 所有熔断器的快照，按目标排序
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|e| e.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
