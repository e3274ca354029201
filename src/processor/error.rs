//! 中继错误类型
//!
//! 定义请求处理与流中继过程中可能发生的错误

use thiserror::Error;

/// 中继错误
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    /// 请求无效
    #[error("请求无效: {0}")]
    InvalidRequest(String),

    /// 未找到可用上游
    #[error("未配置上游: {0}")]
    NoUpstream(String),

    /// 上游拒绝请求
    #[error("上游拒绝请求 ({status}): {message}")]
    UpstreamRejected { status: u16, message: String },

    /// 上游调用失败
    #[error("上游调用失败: {0}")]
    Upstream(String),

    /// 熔断器打开
    #[error("熔断器已打开: {target}")]
    CircuitOpen { target: String },

    /// 重试耗尽
    #[error("重试耗尽: 尝试 {attempts} 次后失败 - {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// 连接超时
    #[error("请求超时: {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// 流式响应空闲超时
    #[error("流式响应空闲超时: {timeout_ms}ms")]
    StreamIdleTimeout { timeout_ms: u64 },

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 请求被取消
    #[error("请求已取消")]
    Cancelled,
}

impl RelayError {
    /// 获取对应的 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::InvalidRequest(_) => 400,
            RelayError::NoUpstream(_) => 404,
            RelayError::UpstreamRejected { status, .. } => *status,
            RelayError::Upstream(_) => 502,
            RelayError::CircuitOpen { .. } => 503,
            RelayError::RetriesExhausted { .. } => 503,
            RelayError::Timeout { .. } => 504,
            RelayError::StreamIdleTimeout { .. } => 504,
            RelayError::Internal(_) => 500,
            RelayError::Cancelled => 499,
        }
    }

    /// 获取错误类型字符串
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_) => "invalid_request_error",
            RelayError::NoUpstream(_) => "no_upstream",
            RelayError::UpstreamRejected { .. } => "upstream_rejected",
            RelayError::Upstream(_) => "upstream_error",
            RelayError::CircuitOpen { .. } => "circuit_open",
            RelayError::RetriesExhausted { .. } => "retries_exhausted",
            RelayError::Timeout { .. } => "timeout_error",
            RelayError::StreamIdleTimeout { .. } => "stream_idle_timeout",
            RelayError::Internal(_) => "internal_error",
            RelayError::Cancelled => "cancelled",
        }
    }

    /// 转换为 JSON 错误响应
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.status_code()
            }
        })
    }

    /// 记录带上下文的错误日志
    pub fn log_with_context(&self, request_id: &str, upstream: &str, model: &str) {
        tracing::error!(
            request_id = %request_id,
            upstream = %upstream,
            model = %model,
            error_type = %self.error_type(),
            error_message = %self.to_string(),
            "[Relay] 请求处理失败"
        );
    }
}
