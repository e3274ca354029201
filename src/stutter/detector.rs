//! 重复内容检测器
//!
//! 将四个信号组合为一个置信度：
//!
//! 1. 前缀关系：任一字符串是另一个的前缀
//! 2. 长度递增：新内容比缓冲内容更长
//! 3. 到达时间：到达间隔明显短于会话基线，更像重发而不是新生成
//! 4. 内容相似度：归一化编辑距离达到阈值
//!
//! 判定为重复的条件：前缀关系成立，且加权置信度不低于阈值。

use crate::stutter::buffer::FlushPolicy;
use crate::stutter::similarity::is_similar;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 各信号权重
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalWeights {
    pub prefix: f64,
    pub length: f64,
    pub timing: f64,
    pub similarity: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            prefix: 0.4,
            length: 0.2,
            timing: 0.15,
            similarity: 0.25,
        }
    }
}

/// 检测器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    /// 是否启用重复检测
    pub enabled: bool,
    /// 判定为重复的置信度阈值
    pub confidence_threshold: f64,
    /// 置信度下限，低于此值时强制刷新缓冲
    pub confidence_floor: f64,
    /// 相似度阈值
    pub similarity_threshold: f64,
    /// 到达间隔低于基线的该比例时视为异常
    pub timing_ratio: f64,
    /// 尚无基线时，低于该间隔（毫秒）视为突发重发
    pub burst_window_ms: u64,
    /// 信号权重
    pub weights: SignalWeights,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.6,
            confidence_floor: 0.3,
            similarity_threshold: 0.8,
            timing_ratio: 0.5,
            burst_window_ms: 15,
            weights: SignalWeights::default(),
        }
    }
}

impl DetectorConfig {
    pub fn burst_window(&self) -> Duration {
        Duration::from_millis(self.burst_window_ms)
    }
}

/// 到达时间样本
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingSample {
    /// 距上一个数据块的间隔
    pub gap: Option<Duration>,
    /// 会话历史的平均间隔
    pub baseline: Option<Duration>,
}

/// 单次判定的各信号值
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StutteringSignals {
    pub prefix: bool,
    pub length_progression: bool,
    pub timing_anomaly: bool,
    pub similar: bool,
}

/// 判定结果
#[derive(Debug, Clone, PartialEq)]
pub struct StutteringDecision {
    /// 置信度 [0, 1]
    pub confidence: f64,
    /// 是否为重复内容
    pub is_duplicate: bool,
    /// 触发的刷新策略
    pub triggering_flush_policy: Option<FlushPolicy>,
    /// 各信号值
    pub signals: StutteringSignals,
}

/// 重复内容检测器
#[derive(Debug, Clone)]
pub struct StutteringDetector {
    config: DetectorConfig,
}

impl Default for StutteringDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl StutteringDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// 判定新内容是否为缓冲内容的重发
    pub fn evaluate(&self, buffered: &str, incoming: &str, timing: TimingSample) -> StutteringDecision {
        let signals = StutteringSignals {
            prefix: incoming.starts_with(buffered) || buffered.starts_with(incoming),
            length_progression: incoming.len() > buffered.len(),
            timing_anomaly: self.is_timing_anomaly(timing),
            similar: is_similar(buffered, incoming, self.config.similarity_threshold),
        };

        let confidence = self.confidence(&signals);
        let is_duplicate =
            signals.prefix && confidence + f64::EPSILON >= self.config.confidence_threshold;

        let triggering_flush_policy = if !is_duplicate && confidence < self.config.confidence_floor
        {
            Some(FlushPolicy::ConfidenceFloor)
        } else {
            None
        };

        StutteringDecision {
            confidence,
            is_duplicate,
            triggering_flush_policy,
            signals,
        }
    }

    fn confidence(&self, signals: &StutteringSignals) -> f64 {
        let w = &self.config.weights;
        let score = w.prefix * f64::from(u8::from(signals.prefix))
            + w.length * f64::from(u8::from(signals.length_progression))
            + w.timing * f64::from(u8::from(signals.timing_anomaly))
            + w.similarity * f64::from(u8::from(signals.similar));
        score.clamp(0.0, 1.0)
    }

    fn is_timing_anomaly(&self, timing: TimingSample) -> bool {
        match (timing.gap, timing.baseline) {
            (Some(gap), Some(baseline)) if !baseline.is_zero() => {
                gap.as_secs_f64() < baseline.as_secs_f64() * self.config.timing_ratio
            }
            (Some(gap), _) => gap < self.config.burst_window(),
            _ => false,
        }
    }
}
