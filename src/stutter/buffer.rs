//! 智能缓冲
//!
//! 暂存尚无法判定的内容。任一刷新策略触发时强制输出，
//! 与检测器当前的判断无关。

use crate::stream::events::DataChunk;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// 刷新策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// 缓冲字节数超过阈值
    Size,
    /// 缓冲时间超过上限
    Age,
    /// 收到终止信号（finish reason 或 `[DONE]`）
    Pattern,
    /// 检测器置信度低于下限
    ConfidenceFloor,
}

impl fmt::Display for FlushPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlushPolicy::Size => "size",
            FlushPolicy::Age => "age",
            FlushPolicy::Pattern => "pattern",
            FlushPolicy::ConfidenceFloor => "confidence_floor",
        };
        f.write_str(s)
    }
}

/// 缓冲配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    /// 最大缓冲字节数
    pub max_bytes: usize,
    /// 最长缓冲时间（毫秒）
    pub max_age_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_bytes: 4096,
            max_age_ms: 750,
        }
    }
}

impl BufferConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

#[derive(Debug)]
struct Pending {
    /// 最新到达的数据块，作为输出帧的模板
    template: DataChunk,
    /// 当前缓冲的内容（两者中较长的一个）
    content: String,
    /// 开始缓冲的时间
    since: Instant,
}

/// 一次刷新输出的内容
#[derive(Debug)]
pub struct FlushedContent {
    /// 缓冲内容对应的数据块，内容已改写
    pub chunk: DataChunk,
    /// 在缓冲期间被挂起的无内容帧，按到达顺序
    pub held: Vec<DataChunk>,
    /// 缓冲时长
    pub age: Duration,
}

impl FlushedContent {
    /// 按输出顺序展开为数据块列表
    pub fn into_frames(self) -> Vec<DataChunk> {
        let mut frames = Vec::with_capacity(1 + self.held.len());
        frames.push(self.chunk);
        frames.extend(self.held);
        frames
    }
}

/// 智能缓冲
#[derive(Debug)]
pub struct SmartBuffer {
    config: BufferConfig,
    pending: Option<Pending>,
    held: Vec<DataChunk>,
}

impl SmartBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            pending: None,
            held: Vec::new(),
        }
    }

    /// 是否有待定内容
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// 当前缓冲的内容
    pub fn content(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.content.as_str())
    }

    /// 开始缓冲新内容
    pub fn start(&mut self, chunk: DataChunk, now: Instant) {
        let content = chunk.content.clone();
        self.pending = Some(Pending {
            template: chunk,
            content,
            since: now,
        });
    }

    /// 用重发的数据块替换缓冲
    ///
    /// 保留两者中较长的内容，模板换为最新的数据块；缓冲起始时间不变
    pub fn replace(&mut self, chunk: DataChunk) {
        match self.pending.as_mut() {
            Some(pending) => {
                if chunk.content.len() > pending.content.len() {
                    pending.content = chunk.content.clone();
                }
                pending.template = chunk;
            }
            None => self.start(chunk, Instant::now()),
        }
    }

    /// 挂起一个无内容的帧，在缓冲刷新时紧随其后输出
    pub fn hold(&mut self, chunk: DataChunk) {
        self.held.push(chunk);
    }

    /// 检查大小与时间策略
    pub fn check(&self, now: Instant) -> Option<FlushPolicy> {
        let pending = self.pending.as_ref()?;
        if pending.content.len() > self.config.max_bytes {
            return Some(FlushPolicy::Size);
        }
        if now.saturating_duration_since(pending.since) >= self.config.max_age() {
            return Some(FlushPolicy::Age);
        }
        None
    }

    /// 时间策略的触发时刻
    pub fn deadline(&self) -> Option<Instant> {
        self.pending
            .as_ref()
            .map(|p| p.since + self.config.max_age())
    }

    /// 取出缓冲内容并清空
    pub fn take(&mut self) -> Option<FlushedContent> {
        let held = std::mem::take(&mut self.held);
        match self.pending.take() {
            Some(pending) => {
                let age = pending.since.elapsed();
                let content = pending.content;
                Some(FlushedContent {
                    chunk: pending.template.with_content(&content),
                    held,
                    age,
                })
            }
            None if !held.is_empty() => {
                // 没有待定内容时挂起帧不会出现，这里仍按顺序返回
                let mut iter = held.into_iter();
                let first = iter.next()?;
                Some(FlushedContent {
                    chunk: first,
                    held: iter.collect(),
                    age: Duration::ZERO,
                })
            }
            None => None,
        }
    }

    /// 丢弃缓冲（仅用于取消）
    pub fn clear(&mut self) {
        self.pending = None;
        self.held.clear();
    }
}
