//! SSE 数据行解析器
//!
//! 将上游的一行原始文本归类为 `ParsedChunk`。解析是纯函数，
//! 任何输入都不会 panic，无法解析的行以 `Malformed` 返回。
//!
//! # 支持的格式
//!
//! - OpenAI SSE (`data: {"choices":[{"delta":{"content":"..."}}]}`)
//! - Gemini SSE (`data: {"candidates":[{"content":{"parts":[{"text":"..."}]}}]}`)
//! - 流内错误 (`data: {"error":{...}}`)

use crate::stream::events::{
    ChunkFormat, DataChunk, MalformedReason, ParsedChunk, StopReason, TokenUsage,
    UpstreamErrorPayload,
};
use serde::Deserialize;
use serde_json::Value;

/// SSE 数据行前缀
pub const DATA_MARKER: &str = "data:";

/// 流结束标记
pub const DONE_MARKER: &str = "[DONE]";

/// 上游数据块在解析边界的显式标签变体
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProviderChunk {
    Error { error: ErrorBody },
    OpenAi(OpenAiChunk),
    Gemini(GeminiChunk),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Detailed {
        #[serde(default)]
        code: Option<Value>,
        #[serde(default)]
        status: Option<Value>,
        #[serde(default, rename = "type")]
        error_type: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Message(String),
}

#[derive(Debug, Deserialize)]
struct OpenAiChunk {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: Option<OpenAiDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiChunk {
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

/// 数据行解析器
///
/// 无状态，所有方法均为关联函数
#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkParser;

impl ChunkParser {
    /// 解析一行原始输入
    pub fn parse(line: &str) -> ParsedChunk {
        let trimmed = line.trim_end_matches(['\r', '\n']);

        if trimmed.trim().is_empty() {
            return ParsedChunk::Empty;
        }

        // SSE 注释与其他字段行不携带内容
        if trimmed.starts_with(':') || is_sse_field_line(trimmed) {
            return ParsedChunk::Empty;
        }

        let Some(rest) = trimmed.strip_prefix(DATA_MARKER) else {
            return ParsedChunk::Malformed {
                raw: line.to_string(),
                error: "缺少 SSE data 前缀".to_string(),
                reason: MalformedReason::MissingDataMarker,
            };
        };
        let payload = rest.strip_prefix(' ').unwrap_or(rest).trim();

        if payload == DONE_MARKER {
            return ParsedChunk::Done;
        }

        if payload.is_empty() {
            return ParsedChunk::Empty;
        }

        Self::parse_payload(line, payload)
    }

    fn parse_payload(raw: &str, payload: &str) -> ParsedChunk {
        let value: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                return ParsedChunk::Malformed {
                    raw: raw.to_string(),
                    error: format!("JSON 解析失败: {e}"),
                    reason: MalformedReason::InvalidJson,
                }
            }
        };

        let decoded = match serde_json::from_value::<ProviderChunk>(value.clone()) {
            Ok(chunk) => chunk,
            Err(_) => {
                return ParsedChunk::Malformed {
                    raw: raw.to_string(),
                    error: "数据块结构无效: 缺少 choices/candidates 字段".to_string(),
                    reason: MalformedReason::InvalidShape,
                }
            }
        };

        match decoded {
            ProviderChunk::Error { error } => ParsedChunk::UpstreamError(error.into_payload()),
            ProviderChunk::OpenAi(chunk) => Self::from_openai(raw, chunk, value),
            ProviderChunk::Gemini(chunk) => Self::from_gemini(chunk, value),
        }
    }

    fn from_openai(raw: &str, chunk: OpenAiChunk, payload: Value) -> ParsedChunk {
        let usage = chunk
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));

        // 仅含 usage 的尾块：choices 为空
        let Some(choice) = chunk.choices.into_iter().next() else {
            return ParsedChunk::Data(DataChunk {
                content: String::new(),
                finish_reason: None,
                model: chunk.model,
                usage,
                format: ChunkFormat::OpenAi,
                payload,
            });
        };

        let Some(delta) = choice.delta else {
            return ParsedChunk::Malformed {
                raw: raw.to_string(),
                error: "数据块结构无效: choices[0] 缺少 delta 字段".to_string(),
                reason: MalformedReason::InvalidShape,
            };
        };

        ParsedChunk::Data(DataChunk {
            content: delta.content.unwrap_or_default(),
            finish_reason: choice.finish_reason.as_deref().map(StopReason::parse),
            model: chunk.model,
            usage,
            format: ChunkFormat::OpenAi,
            payload,
        })
    }

    fn from_gemini(chunk: GeminiChunk, payload: Value) -> ParsedChunk {
        let usage = chunk
            .usage_metadata
            .map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count));

        let (content, finish_reason) = match chunk.candidates.into_iter().next() {
            Some(candidate) => {
                let text: String = candidate
                    .content
                    .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
                    .unwrap_or_default();
                (
                    text,
                    candidate.finish_reason.as_deref().map(StopReason::parse),
                )
            }
            None => (String::new(), None),
        };

        ParsedChunk::Data(DataChunk {
            content,
            finish_reason,
            model: chunk.model_version,
            usage,
            format: ChunkFormat::Gemini,
            payload,
        })
    }
}

impl ErrorBody {
    fn into_payload(self) -> UpstreamErrorPayload {
        match self {
            ErrorBody::Detailed {
                code,
                status,
                error_type,
                message,
            } => UpstreamErrorPayload {
                status: code
                    .as_ref()
                    .and_then(status_from_value)
                    .or_else(|| status.as_ref().and_then(status_from_value)),
                error_type: error_type.or_else(|| {
                    status
                        .as_ref()
                        .and_then(|s| s.as_str())
                        .map(|s| s.to_string())
                }),
                message: message.unwrap_or_default(),
            },
            ErrorBody::Message(message) => UpstreamErrorPayload {
                status: None,
                error_type: None,
                message,
            },
        }
    }
}

fn status_from_value(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn is_sse_field_line(line: &str) -> bool {
    ["event:", "id:", "retry:"]
        .iter()
        .any(|field| line.starts_with(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_lines_are_empty() {
        assert_eq!(ChunkParser::parse(""), ParsedChunk::Empty);
        assert_eq!(ChunkParser::parse("   \t"), ParsedChunk::Empty);
        assert_eq!(ChunkParser::parse("\r\n"), ParsedChunk::Empty);
        assert_eq!(ChunkParser::parse(": keep-alive"), ParsedChunk::Empty);
        assert_eq!(ChunkParser::parse("event: message"), ParsedChunk::Empty);
    }

    #[test]
    fn test_done_marker() {
        assert_eq!(ChunkParser::parse("data: [DONE]"), ParsedChunk::Done);
        assert_eq!(ChunkParser::parse("data:[DONE]"), ParsedChunk::Done);
        assert_eq!(ChunkParser::parse("data: [DONE]\r"), ParsedChunk::Done);
    }

    #[test]
    fn test_missing_marker_is_malformed() {
        match ChunkParser::parse("hello world") {
            ParsedChunk::Malformed { raw, reason, .. } => {
                assert_eq!(raw, "hello world");
                assert_eq!(reason, MalformedReason::MissingDataMarker);
            }
            other => panic!("Expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        match ChunkParser::parse("data: {not json") {
            ParsedChunk::Malformed {
                raw, error, reason, ..
            } => {
                assert_eq!(raw, "data: {not json");
                assert!(error.contains("JSON"));
                assert_eq!(reason, MalformedReason::InvalidJson);
            }
            other => panic!("Expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_shape_is_invalid_chunk() {
        match ChunkParser::parse(r#"data: {"foo": 1}"#) {
            ParsedChunk::Malformed { reason, .. } => {
                assert_eq!(reason, MalformedReason::InvalidShape)
            }
            other => panic!("Expected Malformed, got {other:?}"),
        }

        match ChunkParser::parse(r#"data: {"choices":[{"index":0}]}"#) {
            ParsedChunk::Malformed { reason, .. } => {
                assert_eq!(reason, MalformedReason::InvalidShape)
            }
            other => panic!("Expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_openai_content_chunk() {
        let line = r#"data: {"id":"c1","model":"gpt-4","choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        match ChunkParser::parse(line) {
            ParsedChunk::Data(chunk) => {
                assert_eq!(chunk.content, "Hello");
                assert_eq!(chunk.model.as_deref(), Some("gpt-4"));
                assert_eq!(chunk.format, ChunkFormat::OpenAi);
                assert!(chunk.finish_reason.is_none());
                assert!(chunk.usage.is_none());
            }
            other => panic!("Expected Data, got {other:?}"),
        }
    }

    #[test]
    fn test_openai_defaults_missing_fields() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        match ChunkParser::parse(line) {
            ParsedChunk::Data(chunk) => {
                assert_eq!(chunk.content, "");
                assert!(chunk.model.is_none());
                assert!(!chunk.has_content());
            }
            other => panic!("Expected Data, got {other:?}"),
        }
    }

    #[test]
    fn test_openai_finish_and_usage() {
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#;
        match ChunkParser::parse(line) {
            ParsedChunk::Data(chunk) => {
                assert_eq!(chunk.finish_reason, Some(StopReason::EndTurn));
                assert_eq!(chunk.usage, Some(TokenUsage::new(10, 5)));
                assert!(chunk.is_terminal());
            }
            other => panic!("Expected Data, got {other:?}"),
        }
    }

    #[test]
    fn test_openai_usage_only_trailer() {
        let line = r#"data: {"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4}}"#;
        match ChunkParser::parse(line) {
            ParsedChunk::Data(chunk) => {
                assert!(!chunk.has_content());
                assert_eq!(chunk.usage, Some(TokenUsage::new(3, 4)));
            }
            other => panic!("Expected Data, got {other:?}"),
        }
    }

    #[test]
    fn test_gemini_chunk() {
        let line = r#"data: {"candidates":[{"content":{"role":"model","parts":[{"text":"Hi"},{"text":" there"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":7,"candidatesTokenCount":2},"modelVersion":"gemini-2.0-flash"}"#;
        match ChunkParser::parse(line) {
            ParsedChunk::Data(chunk) => {
                assert_eq!(chunk.content, "Hi there");
                assert_eq!(chunk.format, ChunkFormat::Gemini);
                assert_eq!(chunk.finish_reason, Some(StopReason::EndTurn));
                assert_eq!(chunk.usage, Some(TokenUsage::new(7, 2)));
                assert_eq!(chunk.model.as_deref(), Some("gemini-2.0-flash"));
            }
            other => panic!("Expected Data, got {other:?}"),
        }
    }

    #[test]
    fn test_error_payload() {
        let line = r#"data: {"error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        match ChunkParser::parse(line) {
            ParsedChunk::UpstreamError(err) => {
                assert_eq!(err.error_type.as_deref(), Some("overloaded_error"));
                assert!(err.is_overload());
            }
            other => panic!("Expected UpstreamError, got {other:?}"),
        }

        let line = r#"data: {"error":{"code":503,"message":"The model is overloaded.","status":"UNAVAILABLE"}}"#;
        match ChunkParser::parse(line) {
            ParsedChunk::UpstreamError(err) => {
                assert_eq!(err.status, Some(503));
                assert_eq!(err.error_type.as_deref(), Some("UNAVAILABLE"));
            }
            other => panic!("Expected UpstreamError, got {other:?}"),
        }

        let line = r#"data: {"error":"boom"}"#;
        match ChunkParser::parse(line) {
            ParsedChunk::UpstreamError(err) => assert_eq!(err.message, "boom"),
            other => panic!("Expected UpstreamError, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_never_panics_on_garbage() {
        for line in [
            "data:",
            "data: ",
            "data: null",
            "data: 42",
            "data: []",
            "data: \"text\"",
            "data: {\"choices\": null}",
            "data: {\"candidates\": 1}",
            "\u{0}\u{1}",
        ] {
            let _ = ChunkParser::parse(line);
        }
    }
}
