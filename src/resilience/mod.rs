//! 容错机制模块
//!
//! 提供熔断、重试、超时控制与错误恢复决策

pub mod circuit_breaker;
pub mod recovery;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{
    BreakerSnapshot, BreakerTransition, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitState,
};
pub use recovery::{
    ErrorKind, ErrorRecord, ErrorRecoveryManager, GuardedError, OpenBreakerAction,
    RecoveryAction, RecoveryPolicy, StreamFailure,
};
pub use retry::{RetryConfig, RetryError, RetryExecutor, Retryable, RETRYABLE_STATUS_CODES};
pub use timeout::{TimeoutConfig, TimeoutController, TimeoutError};

#[cfg(test)]
mod tests;
