//! 流处理器
//!
//! 每个客户端流式请求一个 `StreamProcessor`，由单个任务独占：
//!
//! ```text
//! LineSource ──> ChunkParser ──> 状态分发 ──> StutterFilter ──> SseFrameEncoder ──> SseSink
//!                                   │
//!                                   └── 失败 ──> ErrorRecoveryManager ──> CircuitBreaker / 退避
//! ```
//!
//! 同步部分（`process_chunk` / `handle_failure` / `terminate` 等）只产生待写入的帧，
//! `run` 负责读取、计时、取消与写入。

pub mod error;
pub mod io;
pub mod state;

pub use error::RelayError;
pub use io::{
    ByteStreamLineSource, ChannelLineSource, ChannelSink, LineSource, SseSink, WriterSink,
};
pub use state::{
    ContentHistory, SessionSummary, StreamSession, StreamState, TerminationReason,
};

use crate::config::StreamConfig;
use crate::resilience::{
    CircuitBreaker, ErrorRecoveryManager, RecoveryAction, StreamFailure, TimeoutController,
};
use crate::stream::{ChunkParser, DataChunk, MalformedReason, ParsedChunk, SseFrameEncoder};
use crate::stutter::StutterOutcome;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// 流处理器
#[derive(Debug)]
pub struct StreamProcessor {
    session: StreamSession,
    recovery: ErrorRecoveryManager,
    timeouts: TimeoutController,
    encoder: SseFrameEncoder,
    /// 当前故障周期内已执行的重试次数
    retry_attempt: u32,
    /// 已决定重试，等待下一次成功读取以上报熔断器
    awaiting_retry: bool,
    /// 退避结束时刻，之前不读取上游
    backoff_until: Option<Instant>,
}

impl StreamProcessor {
    pub fn new(config: &StreamConfig, breaker: Arc<CircuitBreaker>, model: Option<String>) -> Self {
        let session = StreamSession::new(
            config.detector.clone(),
            config.buffer.clone(),
            config.history_size,
            model,
        );
        tracing::debug!(
            session_id = %session.id,
            target_key = %breaker.target(),
            "[StreamProcessor] 创建会话"
        );
        Self {
            session,
            recovery: ErrorRecoveryManager::new(
                config.recovery.clone(),
                config.retry.clone(),
                breaker,
            ),
            timeouts: TimeoutController::new(config.timeout.clone()),
            encoder: SseFrameEncoder::new(),
            retry_attempt: 0,
            awaiting_retry: false,
            backoff_until: None,
        }
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    pub fn state(&self) -> StreamState {
        self.session.state
    }

    pub fn is_terminated(&self) -> bool {
        self.session.state.is_terminal()
    }

    pub fn summary(&self) -> SessionSummary {
        self.session.summary()
    }

    /// 处理一行上游数据，返回需要写入客户端的帧
    pub fn process_chunk(&mut self, raw_line: &str) -> Vec<String> {
        self.process_chunk_at(raw_line, Instant::now())
    }

    /// 同 `process_chunk`，使用指定的到达时刻
    pub fn process_chunk_at(&mut self, raw_line: &str, now: Instant) -> Vec<String> {
        if self.is_terminated() {
            return Vec::new();
        }
        let parsed = ChunkParser::parse(raw_line);
        // 无法解析的行不刷新空闲计时
        if !matches!(parsed, ParsedChunk::Malformed { .. }) {
            self.session.last_activity = now;
        }

        match parsed {
            ParsedChunk::Empty => Vec::new(),
            ParsedChunk::Done => {
                self.note_success();
                self.terminate(TerminationReason::Done)
            }
            ParsedChunk::Data(chunk) => {
                self.note_success();
                self.on_data(chunk, now)
            }
            ParsedChunk::Malformed { raw, error, reason } => {
                self.handle_failure(StreamFailure::Malformed { raw, error, reason })
            }
            ParsedChunk::UpstreamError(payload) => {
                self.handle_failure(StreamFailure::Upstream(payload))
            }
        }
    }

    fn on_data(&mut self, chunk: DataChunk, now: Instant) -> Vec<String> {
        self.session.chunk_count += 1;
        if self.session.model.is_none() {
            self.session.model = chunk.model.clone();
        }
        if let Some(usage) = &chunk.usage {
            self.session.merge_usage(usage);
        }

        if self.session.state == StreamState::Initial && chunk.has_content() {
            self.session.transition(StreamState::Stuttering);
        }

        let frames = match self.session.state {
            StreamState::Initial => vec![chunk],
            StreamState::Stuttering => {
                let timing = self.session.history.timing_sample(now);
                let content = chunk.has_content().then(|| chunk.content.clone());
                let outcome = self.session.filter.on_data(chunk, timing, now);
                if let Some(content) = content {
                    self.session.history.push(content, now);
                }
                self.resolve_stutter(outcome)
            }
            StreamState::NormalFlow => {
                self.record_history(&chunk, now);
                vec![chunk]
            }
            StreamState::Recovering => {
                self.record_history(&chunk, now);
                self.session.transition(StreamState::NormalFlow);
                vec![chunk]
            }
            StreamState::Terminating => Vec::new(),
        };

        self.encode(frames)
    }

    fn record_history(&mut self, chunk: &DataChunk, now: Instant) {
        if chunk.has_content() {
            self.session.history.push(chunk.content.clone(), now);
        }
    }

    fn resolve_stutter(&mut self, outcome: StutterOutcome) -> Vec<DataChunk> {
        match outcome {
            StutterOutcome::Withheld { decision } => {
                if let Some(decision) = decision {
                    tracing::debug!(
                        session_id = %self.session.id,
                        confidence = decision.confidence,
                        "[StreamProcessor] 检测到重发内容，已合并"
                    );
                }
                Vec::new()
            }
            StutterOutcome::Released {
                frames,
                policy,
                decision,
            } => {
                tracing::debug!(
                    session_id = %self.session.id,
                    policy = ?policy,
                    confidence = decision.as_ref().map(|d| d.confidence),
                    "[StreamProcessor] 缓冲已输出，进入正常透传"
                );
                self.session.transition(StreamState::NormalFlow);
                frames
            }
            StutterOutcome::Passthrough(frame) => vec![frame],
        }
    }

    /// 缓冲超过时间上限时强制输出
    pub fn flush_expired(&mut self, now: Instant) -> Vec<String> {
        if self.session.state != StreamState::Stuttering {
            return Vec::new();
        }
        match self.session.filter.flush_expired(now) {
            Some((policy, frames)) => {
                tracing::debug!(
                    session_id = %self.session.id,
                    policy = %policy,
                    "[StreamProcessor] 刷新策略触发，强制输出缓冲"
                );
                self.session.transition(StreamState::NormalFlow);
                self.encode(frames)
            }
            None => Vec::new(),
        }
    }

    /// 缓冲的时间策略截止时刻
    pub fn buffer_deadline(&self) -> Option<Instant> {
        if self.session.state == StreamState::Stuttering {
            self.session.filter.deadline()
        } else {
            None
        }
    }

    /// 处理一次失败，返回需要写入客户端的帧
    pub fn handle_failure(&mut self, failure: StreamFailure) -> Vec<String> {
        if self.is_terminated() {
            return Vec::new();
        }
        self.session.error_count += 1;

        let (record, action) = self.recovery.handle(&failure, self.retry_attempt);
        tracing::debug!(
            session_id = %self.session.id,
            state = %self.session.state,
            kind = %record.kind,
            "[StreamProcessor] 故障: {}",
            record.detail
        );

        // 初始与重复检测阶段就地处理，其余阶段经由 Recovering
        let in_place = matches!(
            self.session.state,
            StreamState::Initial | StreamState::Stuttering
        );
        if !in_place {
            self.session.transition(StreamState::Recovering);
        }

        match action {
            RecoveryAction::Continue => {
                if !in_place {
                    self.session.transition(StreamState::NormalFlow);
                }
                Vec::new()
            }
            RecoveryAction::Retry => {
                let delay = self.recovery.backoff_delay(self.retry_attempt);
                self.retry_attempt += 1;
                self.awaiting_retry = true;
                self.backoff_until = Some(Instant::now() + delay);
                tracing::info!(
                    session_id = %self.session.id,
                    attempt = self.retry_attempt,
                    "[StreamProcessor] {}ms 后继续读取",
                    delay.as_millis()
                );
                Vec::new()
            }
            RecoveryAction::Degrade => self.degrade(),
            RecoveryAction::Terminate => self.terminate(TerminationReason::Fatal(record.kind)),
        }
    }

    /// 关闭重复检测，之后的内容原样透传
    fn degrade(&mut self) -> Vec<String> {
        tracing::warn!(
            session_id = %self.session.id,
            "[StreamProcessor] 降级: 关闭重复检测"
        );
        self.session.degraded = true;
        self.session.filter.disable();
        let frames = self.session.filter.drain();

        match self.session.state {
            StreamState::Stuttering | StreamState::Recovering => {
                self.session.transition(StreamState::NormalFlow);
            }
            _ => {}
        }
        self.encode(frames)
    }

    /// 成功读取到有效数据，结束当前故障周期
    fn note_success(&mut self) {
        if self.awaiting_retry {
            self.recovery.report_success();
            self.awaiting_retry = false;
        }
        self.retry_attempt = 0;
    }

    /// 进入终止状态
    ///
    /// 只生效一次：输出缓冲内容（取消时除外）与唯一的结束标记
    pub fn terminate(&mut self, reason: TerminationReason) -> Vec<String> {
        if self.is_terminated() {
            return Vec::new();
        }

        let writes_trailer = reason.writes_trailer();
        let pending = if writes_trailer {
            self.session.filter.drain()
        } else {
            self.session.filter.discard();
            Vec::new()
        };

        tracing::info!(
            session_id = %self.session.id,
            state = %self.session.state,
            reason = %reason,
            "[StreamProcessor] 会话终止"
        );
        self.session.transition(StreamState::Terminating);
        self.session.reason = Some(reason);
        self.backoff_until = None;

        let mut frames = self.encode(pending);
        if writes_trailer {
            frames.push(self.encoder.done().to_string());
        }
        frames
    }

    /// 客户端取消：丢弃缓冲，不再写入任何内容
    pub fn cancel(&mut self) -> Vec<String> {
        self.terminate(TerminationReason::Cancelled)
    }

    fn encode(&mut self, chunks: Vec<DataChunk>) -> Vec<String> {
        let mut frames = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match self.encoder.encode(&chunk) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    self.session.error_count += 1;
                    tracing::warn!(
                        session_id = %self.session.id,
                        "[StreamProcessor] 数据块序列化失败，已跳过: {}",
                        e
                    );
                }
            }
        }
        frames
    }

    /// 读取失败转换为故障
    fn read_failure(err: std::io::Error) -> StreamFailure {
        if err.kind() == std::io::ErrorKind::InvalidData {
            StreamFailure::Malformed {
                raw: String::new(),
                error: err.to_string(),
                reason: MalformedReason::InvalidJson,
            }
        } else {
            StreamFailure::Transport(err.to_string())
        }
    }

    /// 驱动整个会话直到终止
    ///
    /// 事件按单一顺序分发：取消、整体超时、缓冲时间策略、下一行（带空闲超时）
    ///
    /// 空闲时间从最近一次有效行起算，无法解析的行不会延长空闲窗口。
    /// 退避期间缓冲时间策略照常生效。
    pub async fn run<S, K>(
        mut self,
        source: &mut S,
        sink: &mut K,
        cancel: &CancellationToken,
    ) -> SessionSummary
    where
        S: LineSource + ?Sized,
        K: SseSink + ?Sized,
    {
        let stream_deadline = self.timeouts.stream_deadline(self.session.started);
        let idle_timeout = self.timeouts.config().read_idle_timeout();

        while !self.is_terminated() {
            if let Some(until) = self.backoff_until.take() {
                let buffer_deadline = self.buffer_deadline();
                let frames = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => self.cancel(),
                    _ = sleep_until_opt(stream_deadline) => self.terminate(TerminationReason::StreamTimeout),
                    _ = sleep_until_opt(buffer_deadline) => {
                        self.backoff_until = Some(until);
                        self.flush_expired(Instant::now())
                    }
                    _ = tokio::time::sleep_until(until.into()) => {
                        // 退避时间不计入空闲
                        self.session.last_activity = Instant::now();
                        Vec::new()
                    }
                };
                self.write(sink, frames).await;
                continue;
            }

            let buffer_deadline = self.buffer_deadline();
            let idle_deadline = idle_timeout.map(|idle| (self.session.last_activity + idle, idle));
            let frames = tokio::select! {
                biased;
                _ = cancel.cancelled() => self.cancel(),
                _ = sleep_until_opt(stream_deadline) => self.terminate(TerminationReason::StreamTimeout),
                _ = sleep_until_opt(buffer_deadline) => self.flush_expired(Instant::now()),
                line = read_line(source, idle_deadline) => match line {
                    Ok(Some(line)) => self.process_chunk(&line),
                    Ok(None) => self.terminate(TerminationReason::UpstreamEof),
                    Err(ReadError::Idle(idle)) => {
                        self.session.last_activity = Instant::now();
                        self.handle_failure(StreamFailure::ReadTimeout { idle })
                    }
                    Err(ReadError::Io(e)) => self.handle_failure(Self::read_failure(e)),
                },
            };
            self.write(sink, frames).await;
        }

        let summary = self.summary();
        tracing::info!(
            session_id = %summary.id,
            model = summary.model.as_deref().unwrap_or("-"),
            chunks = summary.chunk_count,
            errors = summary.error_count,
            frames = summary.frames_written,
            degraded = summary.degraded,
            duration_ms = summary.duration_ms,
            "[StreamProcessor] 会话结束: {}",
            summary
                .reason
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default()
        );
        summary
    }

    /// 写入并刷新；终止前写入失败视为客户端断开
    async fn write<K: SseSink + ?Sized>(&mut self, sink: &mut K, frames: Vec<String>) {
        if frames.is_empty() {
            return;
        }
        for frame in &frames {
            if let Err(e) = sink.send_frame(frame).await {
                self.on_sink_closed(e);
                return;
            }
            self.session.frames_written += 1;
        }
        if let Err(e) = sink.flush().await {
            self.on_sink_closed(e);
        }
    }

    fn on_sink_closed(&mut self, err: std::io::Error) {
        if self.is_terminated() {
            // 结束标记尽力写入
            tracing::debug!(
                session_id = %self.session.id,
                "[StreamProcessor] 终止时写入失败: {}",
                err
            );
            return;
        }
        tracing::info!(
            session_id = %self.session.id,
            "[StreamProcessor] 客户端连接已关闭: {}",
            err
        );
        self.terminate(TerminationReason::ClientGone);
    }
}

enum ReadError {
    Idle(Duration),
    Io(std::io::Error),
}

/// 读取下一行；`idle` 为空闲截止时刻与对应的空闲时长
async fn read_line<S: LineSource + ?Sized>(
    source: &mut S,
    idle: Option<(Instant, Duration)>,
) -> Result<Option<String>, ReadError> {
    match idle {
        Some((deadline, idle)) => {
            match tokio::time::timeout_at(deadline.into(), source.next_line()).await {
                Ok(result) => result.map_err(ReadError::Io),
                Err(_) => Err(ReadError::Idle(idle)),
            }
        }
        None => source.next_line().await.map_err(ReadError::Io),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
