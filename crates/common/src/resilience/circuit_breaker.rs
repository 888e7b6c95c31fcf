//! Circuit breaker tracking upstream transport health
//!
//! Pure state machine with no I/O, no timers, and no background
//! threads; it is invoked synchronously around calls by the owning
//! [`CallExecutor`](super::CallExecutor). Each executor owns its own
//! breaker, so the state lives in plain fields behind `&mut self`
//! rather than shared atomics.

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::{ConfigError, ConfigResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Circuit is closed, allowing calls
    Closed,
    /// Circuit is open, rejecting calls until the reset timeout elapses
    Open,
    /// Circuit permits a single trial call to probe recovery
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Error returned when the breaker refuses a call.
///
/// Carries the remaining cooldown so the caller can decide whether to
/// wait or abort; the executor never retries through an open breaker.
#[derive(Debug, Error)]
#[error("Circuit breaker is open, rejecting calls (retry in {retry_in:?})")]
pub struct CircuitOpenError {
    /// Time remaining until the next trial call is permitted.
    pub retry_in: Duration,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before permitting a trial call once open
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout: Duration::from_secs(60) }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "failure_threshold must be greater than 0".to_string(),
            });
        }
        if self.reset_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                message: "reset_timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Circuit breaker owned by a single call executor.
///
/// Opens after `failure_threshold` consecutive failures, rejects calls
/// for `reset_timeout`, then permits exactly one trial call whose
/// outcome alone decides between closing and re-opening.
#[derive(Debug)]
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    state: BreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    clock: C,
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker with the given configuration using
    /// the system clock.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }

    /// Create a circuit breaker with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for
    /// testing).
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> Self {
        Self { config, state: BreakerState::Closed, failure_count: 0, last_failure_time: None, clock }
    }

    /// Check whether a call may proceed.
    ///
    /// Fails with [`CircuitOpenError`] while the circuit is open and
    /// the reset timeout has not elapsed. Once it has, transitions
    /// `Open -> HalfOpen` exactly once, without resetting the failure
    /// count, and permits the trial call.
    pub fn before_call(&mut self) -> Result<(), CircuitOpenError> {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = self
                    .last_failure_time
                    .map(|t| self.clock.now().duration_since(t))
                    .unwrap_or(self.config.reset_timeout);
                if elapsed >= self.config.reset_timeout {
                    self.state = BreakerState::HalfOpen;
                    debug!("Circuit breaker half-open, permitting trial call");
                    Ok(())
                } else {
                    Err(CircuitOpenError { retry_in: self.config.reset_timeout - elapsed })
                }
            }
        }
    }

    /// Record a successful call: closes the circuit and zeroes the
    /// consecutive failure count.
    pub fn on_success(&mut self) {
        if self.state != BreakerState::Closed {
            info!("Circuit breaker closed after successful call");
        }
        self.state = BreakerState::Closed;
        self.failure_count = 0;
    }

    /// Record a failed call.
    ///
    /// Opens the circuit when consecutive failures reach the threshold.
    /// A failure of the half-open trial call re-opens immediately and
    /// restarts the reset window.
    pub fn on_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure_time = Some(self.clock.now());

        match self.state {
            BreakerState::Closed => {
                if self.failure_count >= self.config.failure_threshold {
                    self.state = BreakerState::Open;
                    warn!("Circuit breaker opened after {} consecutive failures", self.failure_count);
                }
            }
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                warn!("Circuit breaker re-opened after failed trial call");
            }
            BreakerState::Open => {}
        }
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Get the current consecutive failure count
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.last_failure_time = None;
        info!("Circuit breaker manually reset to closed state");
    }
}
