//! 数据块事件类型
//!
//! 定义 ChunkParser 的输出：与具体 Provider 无关的 `ParsedChunk`。
//!
//! # 设计原则
//!
//! - Provider 特定的 JSON 结构只在解析边界解码一次
//! - 核心处理流程只看到 `ParsedChunk`
//! - `DataChunk` 保留原始 JSON，重新成帧时只改写增量内容

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 上游数据块的 Provider 格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkFormat {
    /// OpenAI Chat Completions chunk (`choices[].delta.content`)
    OpenAi,
    /// Gemini 原生 chunk (`candidates[].content.parts[].text`)
    Gemini,
}

/// 停止原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// 正常结束
    EndTurn,
    /// 达到最大 token 数
    MaxTokens,
    /// 需要工具调用
    ToolUse,
    /// 命中停止序列
    StopSequence,
    /// 内容过滤
    ContentFilter,
    /// 其他原因
    Other(String),
}

impl StopReason {
    /// 从 OpenAI / Gemini 的 finish reason 字符串解析
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "end_turn" | "stop" => Self::EndTurn,
            "max_tokens" | "length" => Self::MaxTokens,
            "tool_use" | "tool_calls" | "function_call" => Self::ToolUse,
            "stop_sequence" => Self::StopSequence,
            "content_filter" | "safety" | "recitation" => Self::ContentFilter,
            _ => Self::Other(s.to_string()),
        }
    }
}

/// Token 使用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// 输入 token 数
    pub input_tokens: u32,
    /// 输出 token 数
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// 合并上游报告的用量
    ///
    /// 上游报告的是截至当前的累计值，因此取各字段最大值而不是求和
    pub fn merge(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
    }

    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// 一个有效的数据块
#[derive(Debug, Clone, PartialEq)]
pub struct DataChunk {
    /// 增量文本内容（缺失时为空字符串）
    pub content: String,
    /// 停止原因
    pub finish_reason: Option<StopReason>,
    /// 上游报告的模型名称
    pub model: Option<String>,
    /// 上游报告的用量
    pub usage: Option<TokenUsage>,
    /// 解码时识别出的 Provider 格式
    pub format: ChunkFormat,
    /// 原始 JSON，用于重新成帧
    pub payload: Value,
}

impl DataChunk {
    /// 是否携带文本内容
    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }

    /// 是否为终止块（带有 finish reason）
    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// 用新的内容替换增量文本，同步改写原始 JSON
    pub fn replace_content(&mut self, content: &str) {
        self.content = content.to_string();
        match self.format {
            ChunkFormat::OpenAi => rewrite_openai_content(&mut self.payload, content),
            ChunkFormat::Gemini => rewrite_gemini_content(&mut self.payload, content),
        }
    }

    /// 消费自身并返回替换内容后的数据块
    pub fn with_content(mut self, content: &str) -> Self {
        self.replace_content(content);
        self
    }
}

fn rewrite_openai_content(payload: &mut Value, content: &str) {
    let delta = payload
        .get_mut("choices")
        .and_then(|c| c.get_mut(0))
        .and_then(|choice| choice.get_mut("delta"))
        .and_then(|d| d.as_object_mut());

    if let Some(delta) = delta {
        delta.insert("content".to_string(), Value::String(content.to_string()));
    }
}

fn rewrite_gemini_content(payload: &mut Value, content: &str) {
    let parts = payload
        .get_mut("candidates")
        .and_then(|c| c.get_mut(0))
        .and_then(|candidate| candidate.get_mut("content"))
        .and_then(|c| c.get_mut("parts"))
        .and_then(|p| p.as_array_mut());

    let Some(parts) = parts else {
        return;
    };

    // 多个 text part 合并为一个，保留非文本 part 的相对位置
    let mut rewritten = Vec::with_capacity(parts.len());
    let mut inserted = false;
    for part in parts.drain(..) {
        if part.get("text").is_some() {
            if !inserted {
                rewritten.push(serde_json::json!({ "text": content }));
                inserted = true;
            }
        } else {
            rewritten.push(part);
        }
    }
    if !inserted {
        rewritten.insert(0, serde_json::json!({ "text": content }));
    }
    *parts = rewritten;
}

/// 数据行无效的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// 缺少 SSE `data:` 前缀
    MissingDataMarker,
    /// payload 不是合法 JSON
    InvalidJson,
    /// JSON 合法但结构不符合任何已知 Provider 格式
    InvalidShape,
}

/// 流内上游错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamErrorPayload {
    /// HTTP 风格的状态码（如果上游提供）
    pub status: Option<u16>,
    /// 错误类型（如 `overloaded_error`）
    pub error_type: Option<String>,
    /// 错误消息
    pub message: String,
}

impl UpstreamErrorPayload {
    /// 是否为过载 / 限流 / 5xx 信号
    pub fn is_overload(&self) -> bool {
        if let Some(status) = self.status {
            if status == 429 || status >= 500 {
                return true;
            }
        }
        let haystack = format!(
            "{} {}",
            self.error_type.as_deref().unwrap_or_default(),
            self.message
        )
        .to_lowercase();
        OVERLOAD_KEYWORDS.iter().any(|k| haystack.contains(k))
    }
}

/// 表示上游过载的错误关键词
pub const OVERLOAD_KEYWORDS: &[&str] = &[
    "overloaded",
    "rate limit",
    "rate_limit",
    "resource_exhausted",
    "unavailable",
    "too many requests",
];

/// 单行解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedChunk {
    /// 有效数据块
    Data(DataChunk),
    /// 流结束标记 `[DONE]`
    Done,
    /// 空行或 SSE 元数据行
    Empty,
    /// 无法解析的行，保留原始内容与错误信息
    Malformed {
        raw: String,
        error: String,
        reason: MalformedReason,
    },
    /// 上游在流内发送的错误
    UpstreamError(UpstreamErrorPayload),
}

impl ParsedChunk {
    pub fn is_data(&self) -> bool {
        matches!(self, ParsedChunk::Data(_))
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, ParsedChunk::Malformed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn openai_chunk(content: &str) -> DataChunk {
        DataChunk {
            content: content.to_string(),
            finish_reason: None,
            model: Some("gpt-4".to_string()),
            usage: None,
            format: ChunkFormat::OpenAi,
            payload: json!({
                "id": "chatcmpl-1",
                "model": "gpt-4",
                "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
            }),
        }
    }

    #[test]
    fn test_stop_reason_parse() {
        assert_eq!(StopReason::parse("stop"), StopReason::EndTurn);
        assert_eq!(StopReason::parse("STOP"), StopReason::EndTurn);
        assert_eq!(StopReason::parse("length"), StopReason::MaxTokens);
        assert_eq!(StopReason::parse("MAX_TOKENS"), StopReason::MaxTokens);
        assert_eq!(StopReason::parse("tool_calls"), StopReason::ToolUse);
        assert_eq!(StopReason::parse("SAFETY"), StopReason::ContentFilter);
        assert_eq!(
            StopReason::parse("weird"),
            StopReason::Other("weird".to_string())
        );
    }

    #[test]
    fn test_usage_merge_keeps_cumulative_maximum() {
        let mut usage = TokenUsage::new(10, 3);
        usage.merge(&TokenUsage::new(10, 7));
        usage.merge(&TokenUsage::new(0, 5));
        assert_eq!(usage, TokenUsage::new(10, 7));
        assert_eq!(usage.total(), 17);
    }

    #[test]
    fn test_replace_content_openai() {
        let chunk = openai_chunk("Hel").with_content("Hello");
        assert_eq!(chunk.content, "Hello");
        assert_eq!(chunk.payload["choices"][0]["delta"]["content"], "Hello");
        assert_eq!(chunk.payload["id"], "chatcmpl-1");
    }

    #[test]
    fn test_replace_content_gemini_merges_text_parts() {
        let mut chunk = DataChunk {
            content: "ab".to_string(),
            finish_reason: None,
            model: None,
            usage: None,
            format: ChunkFormat::Gemini,
            payload: json!({
                "candidates": [{
                    "content": {
                        "role": "model",
                        "parts": [{"text": "a"}, {"functionCall": {"name": "f"}}, {"text": "b"}]
                    }
                }]
            }),
        };
        chunk.replace_content("abc");

        let parts = chunk.payload["candidates"][0]["content"]["parts"]
            .as_array()
            .unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["text"], "abc");
        assert_eq!(parts[1]["functionCall"]["name"], "f");
    }

    #[test]
    fn test_upstream_error_overload_detection() {
        let overloaded = UpstreamErrorPayload {
            status: None,
            error_type: Some("overloaded_error".to_string()),
            message: "Overloaded".to_string(),
        };
        assert!(overloaded.is_overload());

        let server_error = UpstreamErrorPayload {
            status: Some(503),
            error_type: None,
            message: "backend".to_string(),
        };
        assert!(server_error.is_overload());

        let bad_request = UpstreamErrorPayload {
            status: Some(400),
            error_type: Some("invalid_request_error".to_string()),
            message: "bad input".to_string(),
        };
        assert!(!bad_request.is_overload());
    }
}
