//! Reliability patterns shared by the dispatcher and control-flow interpreter
//!
//! - [`RetryPolicy`] - configurable retry with exponential backoff and jitter
//! - [`CircuitBreakerConfig`] / [`CircuitBreaker`] - failure-threshold tripping
//! - [`TimeoutConfig`] / [`TimeoutManager`] - schedule-to-start, start-to-close,
//!   and heartbeat timeout accounting

mod breaker;
mod circuit_breaker;
mod retry;
mod timeout;

pub use breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerPermit};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitState};
pub use retry::RetryPolicy;
pub use timeout::{JobTimingInfo, TimeoutConfig, TimeoutError, TimeoutManager, TimeoutType};
