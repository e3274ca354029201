//! 请求处理器

mod chat;
mod health;

pub use chat::{chat_completions, UpstreamConnectError};
pub use health::health;

use crate::processor::RelayError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// 错误转换为 JSON 响应
pub fn error_response(error: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error.to_json())).into_response()
}
