//! Chat Completions 透传
//!
//! # 流式请求
//!
//! 1. 在熔断器与重试保护下连接默认上游（整体受请求超时限制）
//! 2. 响应体转为 `ByteStreamLineSource`，由独立任务中的 `StreamProcessor` 处理
//! 3. 处理器写入 mpsc channel，接收端作为 SSE 响应体
//!
//! 客户端断开时响应体被丢弃，取消令牌随之触发，会话立即终止。
//!
//! # 非流式请求
//!
//! 上游响应原样返回。

use super::error_response;
use crate::processor::{ByteStreamLineSource, ChannelSink, RelayError, StreamProcessor};
use crate::resilience::{
    ErrorKind, ErrorRecoveryManager, GuardedError, RecoveryPolicy, RetryConfig, RetryError,
    Retryable, TimeoutController, TimeoutError,
};
use crate::server::AppState;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// 响应体 channel 容量
const BODY_CHANNEL_CAPACITY: usize = 64;

/// 连接上游失败
#[derive(Debug, Error)]
#[error("{message}")]
pub struct UpstreamConnectError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
    retryable: bool,
}

impl UpstreamConnectError {
    /// 上游返回非 2xx 状态
    pub fn from_status(
        status: u16,
        body: String,
        retry: &RetryConfig,
        policy: &RecoveryPolicy,
    ) -> Self {
        let kind = if retry.is_retryable(status) {
            ErrorKind::UpstreamOverload
        } else {
            ErrorKind::UpstreamRejected
        };
        Self {
            kind,
            status: Some(status),
            message: format!("上游返回 {}: {}", status, body),
            retryable: policy.is_retryable(kind),
        }
    }

    /// 请求未能完成
    pub fn from_transport(error: &reqwest::Error, policy: &RecoveryPolicy) -> Self {
        let kind = if error.is_timeout() {
            ErrorKind::NetworkTimeout
        } else {
            ErrorKind::ConnectionLost
        };
        Self {
            kind,
            status: None,
            message: format!("连接上游失败: {}", error),
            retryable: policy.is_retryable(kind),
        }
    }
}

impl Retryable for UpstreamConnectError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn trips_breaker(&self) -> bool {
        self.kind.trips_breaker()
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let is_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string);

    let Some(upstream) = state.config.default_upstream().cloned() else {
        let error = RelayError::NoUpstream("未配置默认上游".to_string());
        error.log_with_context(&request_id, "-", model.as_deref().unwrap_or("-"));
        return error_response(&error);
    };

    let breaker = state.registry.for_url(&upstream.base_url);
    if breaker.is_open() {
        let error = RelayError::CircuitOpen {
            target: breaker.target().to_string(),
        };
        error.log_with_context(&request_id, &upstream.name, model.as_deref().unwrap_or("-"));
        return error_response(&error);
    }

    tracing::info!(
        request_id = %request_id,
        upstream = %upstream.name,
        model = model.as_deref().unwrap_or("-"),
        stream = is_stream,
        "[Chat] 收到请求"
    );

    let stream_config = &state.config.stream;
    let recovery = ErrorRecoveryManager::new(
        stream_config.recovery.clone(),
        stream_config.retry.clone(),
        breaker.clone(),
    );
    let timeouts = TimeoutController::new(stream_config.timeout.clone());
    let url = upstream.endpoint(CHAT_COMPLETIONS_PATH);
    let cancel = CancellationToken::new();

    let response = match connect(
        &state.client,
        &url,
        upstream.api_key.as_deref(),
        &body,
        &recovery,
        &timeouts,
        &cancel,
    )
    .await
    {
        Ok(response) => response,
        Err(error) => {
            error.log_with_context(&request_id, &upstream.name, model.as_deref().unwrap_or("-"));
            return error_response(&error);
        }
    };

    if !is_stream {
        return passthrough(response).await;
    }

    let processor = StreamProcessor::new(stream_config, breaker, model);
    stream_response(processor, response, cancel)
}

/// 连接上游，返回状态为 2xx 的响应
async fn connect(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &Value,
    recovery: &ErrorRecoveryManager,
    timeouts: &TimeoutController,
    cancel: &CancellationToken,
) -> Result<reqwest::Response, RelayError> {
    let policy = recovery.policy();
    let retry = recovery.retry_config();
    let attempt =
        recovery.execute_with_retry(move || send_once(client, url, api_key, body, retry, policy));

    match timeouts.execute_with_timeout_and_cancel(attempt, cancel).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(error)) => Err(connect_error(error, recovery)),
        Err(TimeoutError::RequestTimeout { timeout_ms, .. }) => {
            Err(RelayError::Timeout { timeout_ms })
        }
        Err(TimeoutError::Cancelled) => Err(RelayError::Cancelled),
        Err(other) => Err(RelayError::Internal(other.to_string())),
    }
}

async fn send_once(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &Value,
    retry: &RetryConfig,
    policy: &RecoveryPolicy,
) -> Result<reqwest::Response, UpstreamConnectError> {
    let mut request = client.post(url).json(body);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }

    let response = request
        .send()
        .await
        .map_err(|e| UpstreamConnectError::from_transport(&e, policy))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(UpstreamConnectError::from_status(
        status.as_u16(),
        text,
        retry,
        policy,
    ))
}

fn connect_error(
    error: RetryError<GuardedError<UpstreamConnectError>>,
    recovery: &ErrorRecoveryManager,
) -> RelayError {
    let attempts = error.attempts;
    match error.into_inner() {
        GuardedError::CircuitOpen => RelayError::CircuitOpen {
            target: recovery.breaker().target().to_string(),
        },
        GuardedError::Operation(e) if e.is_retryable() => RelayError::RetriesExhausted {
            attempts,
            message: e.message,
        },
        GuardedError::Operation(UpstreamConnectError {
            status: Some(status),
            message,
            ..
        }) => RelayError::UpstreamRejected { status, message },
        GuardedError::Operation(e) => RelayError::Upstream(e.message),
    }
}

/// 原样返回上游响应
async fn passthrough(response: reqwest::Response) -> Response {
    let status = response.status();
    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();

    match response.bytes().await {
        Ok(bytes) => {
            let mut builder = Response::builder().status(status);
            if let Some(content_type) = content_type {
                builder = builder.header(header::CONTENT_TYPE, content_type);
            }
            builder.body(Body::from(bytes)).unwrap_or_else(|_| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({"error": {"message": "Failed to build response"}})),
                )
                    .into_response()
            })
        }
        Err(e) => error_response(&RelayError::Upstream(format!("读取上游响应失败: {}", e))),
    }
}

/// 启动处理任务并返回 SSE 响应
fn stream_response(
    processor: StreamProcessor,
    response: reqwest::Response,
    cancel: CancellationToken,
) -> Response {
    let (tx, mut rx) = mpsc::channel::<Bytes>(BODY_CHANNEL_CAPACITY);

    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut source = ByteStreamLineSource::from_response(response);
        let mut sink = ChannelSink::new(tx);
        processor.run(&mut source, &mut sink, &task_cancel).await;
    });

    // 响应体被丢弃时取消会话
    let guard = cancel.drop_guard();
    let body_stream = async_stream::stream! {
        let _guard = guard;
        while let Some(frame) = rx.recv().await {
            yield Ok::<Bytes, std::io::Error>(frame);
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": {"message": "Failed to build stream response"}})),
            )
                .into_response()
        })
}
