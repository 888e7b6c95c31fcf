//! Resilience patterns for calling a flaky, rate-limiting upstream
//!
//! Three cooperating pieces, each reacting to a different failure mode:
//!
//! - [`CircuitBreaker`]: tracks transport-level health and blocks calls
//!   entirely while the upstream is unreachable.
//! - [`CallExecutor`]: wraps a single network call with bounded retries
//!   and exponential backoff, consulting the breaker around each
//!   logical call.
//! - [`TrafficMonitor`]: watches HTTP status codes across a sliding
//!   window and signals a pacing cooldown when the upstream reports
//!   overload while still reachable.
//!
//! The breaker blocks, the monitor throttles; the two are deliberately
//! independent because they demand different recovery action.

mod circuit_breaker;
mod clock;
mod executor;
mod traffic;

pub use circuit_breaker::{
    BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder,
    CircuitOpenError,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use executor::{CallError, CallExecutor, RetryPolicy, RetryPolicyBuilder, TransportError};
pub use traffic::{TrafficMonitor, TrafficMonitorConfig, TrafficMonitorConfigBuilder};

use thiserror::Error;

/// Configuration validation error shared by the resilience builders.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Result type for configuration builders.
pub type ConfigResult<T> = Result<T, ConfigError>;
