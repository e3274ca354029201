//! 流会话状态
//!
//! 定义会话状态机、内容历史窗口与会话摘要

use crate::stream::events::TokenUsage;
use crate::stutter::{BufferConfig, DetectorConfig, StutterFilter, TimingSample};
use crate::resilience::ErrorKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// 尚未收到内容
    Initial,
    /// 会话开头，检测重发内容
    Stuttering,
    /// 正常透传
    NormalFlow,
    /// 处理可恢复的故障
    Recovering,
    /// 终止（终态）
    Terminating,
}

impl StreamState {
    /// 是否允许转换到目标状态
    pub fn can_transition_to(&self, next: StreamState) -> bool {
        use StreamState::*;
        match (self, next) {
            (Terminating, _) => false,
            (_, Terminating) => true,
            (Initial, Stuttering) => true,
            (Stuttering, NormalFlow) => true,
            (NormalFlow, Recovering) => true,
            (Recovering, NormalFlow) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == StreamState::Terminating
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamState::Initial => "initial",
            StreamState::Stuttering => "stuttering",
            StreamState::NormalFlow => "normal_flow",
            StreamState::Recovering => "recovering",
            StreamState::Terminating => "terminating",
        };
        f.write_str(s)
    }
}

/// 历史记录中的一个数据块
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub content: String,
    pub arrived_at: Instant,
}

/// 最近 K 个数据块的有界历史
#[derive(Debug, Clone)]
pub struct ContentHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl ContentHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// 追加一条记录，超出容量时淘汰最旧的
    pub fn push(&mut self, content: String, arrived_at: Instant) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            content,
            arrived_at,
        });
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// 窗口内相邻数据块的平均到达间隔
    pub fn mean_gap(&self) -> Option<Duration> {
        if self.entries.len() < 2 {
            return None;
        }
        let first = self.entries.front()?.arrived_at;
        let last = self.entries.back()?.arrived_at;
        let gaps = (self.entries.len() - 1) as u32;
        Some(last.saturating_duration_since(first) / gaps)
    }

    /// 相对当前时刻的到达时间样本
    pub fn timing_sample(&self, now: Instant) -> TimingSample {
        TimingSample {
            gap: self
                .last()
                .map(|entry| now.saturating_duration_since(entry.arrived_at)),
            baseline: self.mean_gap(),
        }
    }
}

/// 会话终止原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "detail")]
pub enum TerminationReason {
    /// 收到 `[DONE]`
    Done,
    /// 上游连接正常结束
    UpstreamEof,
    /// 客户端取消
    Cancelled,
    /// 客户端连接已关闭（写入失败）
    ClientGone,
    /// 整体流超时
    StreamTimeout,
    /// 恢复策略决定终止
    Fatal(ErrorKind),
}

impl TerminationReason {
    /// 是否需要输出缓冲内容与结束标记
    pub fn writes_trailer(&self) -> bool {
        !matches!(self, TerminationReason::Cancelled | TerminationReason::ClientGone)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Done => f.write_str("done"),
            TerminationReason::UpstreamEof => f.write_str("upstream_eof"),
            TerminationReason::Cancelled => f.write_str("cancelled"),
            TerminationReason::ClientGone => f.write_str("client_gone"),
            TerminationReason::StreamTimeout => f.write_str("stream_timeout"),
            TerminationReason::Fatal(kind) => write!(f, "fatal({})", kind),
        }
    }
}

/// 会话结束时的摘要
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub model: Option<String>,
    pub chunk_count: u64,
    pub error_count: u64,
    pub frames_written: u64,
    pub usage: Option<TokenUsage>,
    pub degraded: bool,
    pub reason: Option<TerminationReason>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// 一次客户端流式请求的会话
#[derive(Debug)]
pub struct StreamSession {
    pub id: String,
    pub state: StreamState,
    pub history: ContentHistory,
    pub filter: StutterFilter,
    pub chunk_count: u64,
    pub error_count: u64,
    pub frames_written: u64,
    /// 最近一次有效行的到达时刻，空闲超时由此起算
    pub last_activity: Instant,
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    pub degraded: bool,
    pub reason: Option<TerminationReason>,
    pub started_at: DateTime<Utc>,
    pub started: Instant,
}

impl StreamSession {
    pub fn new(
        detector: DetectorConfig,
        buffer: BufferConfig,
        history_size: usize,
        model: Option<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: StreamState::Initial,
            history: ContentHistory::new(history_size),
            filter: StutterFilter::new(detector, buffer),
            chunk_count: 0,
            error_count: 0,
            frames_written: 0,
            last_activity: now,
            model,
            usage: None,
            degraded: false,
            reason: None,
            started_at: Utc::now(),
            started: now,
        }
    }

    /// 按允许的边转换状态
    ///
    /// 非法转换被忽略并返回 false
    pub fn transition(&mut self, next: StreamState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            tracing::debug!(
                session_id = %self.id,
                "[StreamSession] 忽略非法状态转换: {} -> {}",
                self.state,
                next
            );
            return false;
        }
        tracing::debug!(
            session_id = %self.id,
            "[StreamSession] 状态转换: {} -> {}",
            self.state,
            next
        );
        self.state = next;
        true
    }

    /// 合并上游报告的用量
    pub fn merge_usage(&mut self, usage: &TokenUsage) {
        match self.usage.as_mut() {
            Some(existing) => existing.merge(usage),
            None => self.usage = Some(*usage),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            model: self.model.clone(),
            chunk_count: self.chunk_count,
            error_count: self.error_count,
            frames_written: self.frames_written,
            usage: self.usage,
            degraded: self.degraded,
            reason: self.reason.clone(),
            started_at: self.started_at,
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}
