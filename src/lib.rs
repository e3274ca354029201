//! relaycast
//!
//! SSE 流式透传代理：修复上游重复发送的前导内容（stuttering），
//! 吸收瞬时故障，并通过熔断器防止级联失败。
//!
//! # 模块结构
//!
//! - `stream`: SSE 数据行解析与重新成帧
//! - `stutter`: 重复内容检测与智能缓冲
//! - `resilience`: 熔断、重试、超时与错误恢复
//! - `processor`: 会话状态机与流处理器
//! - `config`: YAML 配置
//! - `server`: HTTP 服务

pub mod config;
pub mod processor;
pub mod resilience;
pub mod server;
pub mod stream;
pub mod stutter;

pub use config::{ConfigError, RelayConfig, StreamConfig};
pub use processor::{RelayError, SessionSummary, StreamProcessor, StreamState};
pub use resilience::{CircuitBreaker, CircuitBreakerRegistry, ErrorRecoveryManager};
pub use stream::{ChunkParser, ParsedChunk};
pub use stutter::StutterFilter;
