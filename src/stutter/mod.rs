//! 重复内容（stuttering）修复
//!
//! 上游有时会在后续数据块中重发已经发送过的前导内容。
//! 本模块在会话开始阶段暂存内容，识别重发并合并，只输出一次。
//!
//! # 模块结构
//!
//! - `detector`: 四信号置信度判定 (`StutteringDetector`)
//! - `buffer`: 暂存与刷新策略 (`SmartBuffer`)
//! - `similarity`: 编辑距离
//!
//! `StutterFilter` 把两者组合成会话使用的单一入口。

pub mod buffer;
pub mod detector;
pub mod similarity;

pub use buffer::{BufferConfig, FlushPolicy, FlushedContent, SmartBuffer};
pub use detector::{
    DetectorConfig, SignalWeights, StutteringDecision, StutteringDetector, StutteringSignals,
    TimingSample,
};

use crate::stream::events::DataChunk;
use std::time::Instant;

/// 单个数据块经过过滤器后的结果
#[derive(Debug)]
pub enum StutterOutcome {
    /// 内容被暂存，暂不输出
    Withheld {
        decision: Option<StutteringDecision>,
    },
    /// 缓冲已解决，按顺序输出这些数据块
    Released {
        frames: Vec<DataChunk>,
        policy: Option<FlushPolicy>,
        decision: Option<StutteringDecision>,
    },
    /// 无内容帧且没有待定缓冲，原样输出
    Passthrough(DataChunk),
}

/// 重复检测 + 智能缓冲
#[derive(Debug)]
pub struct StutterFilter {
    detector: StutteringDetector,
    buffer: SmartBuffer,
    disabled: bool,
}

impl StutterFilter {
    pub fn new(detector: DetectorConfig, buffer: BufferConfig) -> Self {
        let disabled = !detector.enabled;
        Self {
            detector: StutteringDetector::new(detector),
            buffer: SmartBuffer::new(buffer),
            disabled,
        }
    }

    /// 检测是否已关闭（降级或配置禁用）
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// 关闭检测，之后的内容直接透传
    pub fn disable(&mut self) {
        self.disabled = true;
    }

    pub fn has_pending(&self) -> bool {
        self.buffer.has_pending()
    }

    /// 当前缓冲的内容
    pub fn pending_content(&self) -> Option<&str> {
        self.buffer.content()
    }

    /// 时间策略的触发时刻
    pub fn deadline(&self) -> Option<Instant> {
        self.buffer.deadline()
    }

    /// 处理一个数据块
    pub fn on_data(&mut self, chunk: DataChunk, timing: TimingSample, now: Instant) -> StutterOutcome {
        if self.disabled {
            let mut frames = self.drain();
            frames.push(chunk);
            return StutterOutcome::Released {
                frames,
                policy: None,
                decision: None,
            };
        }

        if !chunk.has_content() {
            return self.on_empty(chunk);
        }

        if !self.buffer.has_pending() {
            // 第一个内容块无从比较，无条件暂存
            let terminal = chunk.is_terminal();
            self.buffer.start(chunk, now);
            if terminal {
                return self.release(Some(FlushPolicy::Pattern), None, None);
            }
            if let Some(policy) = self.buffer.check(now) {
                return self.release(Some(policy), None, None);
            }
            return StutterOutcome::Withheld { decision: None };
        }

        let buffered = self.buffer.content().unwrap_or_default();
        let decision = self.detector.evaluate(buffered, &chunk.content, timing);

        if decision.is_duplicate {
            let terminal = chunk.is_terminal();
            self.buffer.replace(chunk);
            if terminal {
                return self.release(Some(FlushPolicy::Pattern), None, Some(decision));
            }
            if let Some(policy) = self.buffer.check(now) {
                return self.release(Some(policy), None, Some(decision));
            }
            return StutterOutcome::Withheld {
                decision: Some(decision),
            };
        }

        let policy = if chunk.is_terminal() {
            Some(FlushPolicy::Pattern)
        } else {
            decision.triggering_flush_policy
        };
        self.release(policy, Some(chunk), Some(decision))
    }

    /// 检查时间/大小策略，触发时强制刷新
    pub fn flush_expired(&mut self, now: Instant) -> Option<(FlushPolicy, Vec<DataChunk>)> {
        let policy = self.buffer.check(now)?;
        Some((policy, self.drain()))
    }

    /// 无条件刷新，返回按顺序输出的数据块
    pub fn drain(&mut self) -> Vec<DataChunk> {
        self.buffer
            .take()
            .map(FlushedContent::into_frames)
            .unwrap_or_default()
    }

    /// 丢弃缓冲（客户端取消时使用）
    pub fn discard(&mut self) {
        self.buffer.clear();
    }

    fn on_empty(&mut self, chunk: DataChunk) -> StutterOutcome {
        if !self.buffer.has_pending() {
            return StutterOutcome::Passthrough(chunk);
        }
        if chunk.is_terminal() {
            return self.release(Some(FlushPolicy::Pattern), Some(chunk), None);
        }
        self.buffer.hold(chunk);
        StutterOutcome::Withheld { decision: None }
    }

    fn release(
        &mut self,
        policy: Option<FlushPolicy>,
        trailing: Option<DataChunk>,
        decision: Option<StutteringDecision>,
    ) -> StutterOutcome {
        let mut frames = self.drain();
        frames.extend(trailing);
        StutterOutcome::Released {
            frames,
            policy,
            decision,
        }
    }
}
