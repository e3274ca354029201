//! 流式数据层
//!
//! 提供 SSE 数据行的解析与重新成帧：
//! - 事件类型定义 (events)
//! - 上游数据行解析 (parser)
//! - 下游 SSE 帧生成 (generator)
//!
//! # 架构设计
//!
//! ```text
//! 上游 SSE 行 ──> [ChunkParser] ──> ParsedChunk ──> [StreamProcessor] ──> [SseFrameEncoder] ──> 客户端 SSE
//! ```

pub mod events;
pub mod generator;
pub mod parser;

// 重新导出核心类型
pub use events::{
    ChunkFormat, DataChunk, MalformedReason, ParsedChunk, StopReason, TokenUsage,
    UpstreamErrorPayload,
};
pub use generator::{encode_payload, frame_payload, SseFrameEncoder, DONE_FRAME};
pub use parser::ChunkParser;
