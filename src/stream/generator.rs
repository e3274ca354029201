//! SSE 帧生成器
//!
//! 将处理后的 `DataChunk` 重新编码为 SSE 帧。
//!
//! # 格式说明
//!
//! ```text
//! data: {"id":"chatcmpl-xxx","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}
//!
//! data: [DONE]
//! ```
//!
//! 帧在写入之前完整编码，不会向客户端写出半个 JSON。

use crate::stream::events::DataChunk;
use serde_json::Value;

/// 流结束帧
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// SSE 帧编码器
#[derive(Debug, Default)]
pub struct SseFrameEncoder;

impl SseFrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 将数据块编码为 `data: <json>\n\n`
    pub fn encode(&self, chunk: &DataChunk) -> Result<String, serde_json::Error> {
        encode_payload(&chunk.payload)
    }

    /// 结束帧
    pub fn done(&self) -> &'static str {
        DONE_FRAME
    }
}

/// 将任意 JSON 编码为 SSE 数据帧
pub fn encode_payload(payload: &Value) -> Result<String, serde_json::Error> {
    Ok(format!("data: {}\n\n", serde_json::to_string(payload)?))
}

/// 从 SSE 帧中取出 payload（去掉 `data: ` 前缀与结尾空行）
pub fn frame_payload(frame: &str) -> Option<&str> {
    frame
        .strip_prefix("data: ")
        .map(|rest| rest.trim_end_matches('\n'))
}
