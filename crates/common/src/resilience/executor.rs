//! Resilient call executor: retry with exponential backoff around a
//! single network call, gated by a circuit breaker
//!
//! The executor interprets only transport-level outcomes. HTTP status
//! codes ride through untouched inside the success value; rate-limit
//! signals are the caller's business and feed the
//! [`TrafficMonitor`](super::TrafficMonitor) instead.

use std::future::Future;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitOpenError};
use super::clock::{Clock, SystemClock};
use super::{ConfigError, ConfigResult};

/// Transport-level failure: the upstream could not be reached at all.
///
/// These are the only errors the executor retries. An HTTP response
/// with an error status is a *reachable* upstream saying no, which is
/// not a transport failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be established
    #[error("connection failed: {0}")]
    Connection(String),

    /// The request did not complete in time
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Underlying I/O failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors surfaced by [`CallExecutor::execute`].
#[derive(Debug, Error)]
pub enum CallError {
    /// The breaker refused the call; no network attempt was made and
    /// no retry was consumed.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// Every attempt failed at the transport level.
    #[error("call failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// A shutdown signal arrived during a backoff wait.
    #[error("call interrupted by shutdown signal")]
    Interrupted,
}

/// Retry policy for a resilient call. Immutable after construction.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied per attempt: `base_delay * factor^attempt`
    pub backoff_factor: f64,
    /// Upper bound on any single backoff delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a policy builder
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Validate the policy
    pub fn validate(&self) -> ConfigResult<()> {
        if self.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid {
                message: "backoff_factor must be at least 1.0".to_string(),
            });
        }
        if self.max_delay.is_zero() {
            return Err(ConfigError::Invalid {
                message: "max_delay must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Backoff delay before retrying after the given 0-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = self.base_delay.as_millis() as f64 * self.backoff_factor.powi(attempt as i32);
        let capped = millis.min(self.max_delay.as_millis() as f64) as u64;
        Duration::from_millis(capped)
    }
}

/// Builder for [`RetryPolicy`]
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.policy.max_retries = retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.policy.backoff_factor = factor;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn build(self) -> ConfigResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Wraps a single network call with retry, backoff, and breaker
/// consultation.
///
/// One logical call reports at most one outcome to the breaker: a
/// success on any attempt reports one success; exhausting every retry
/// reports one failure. The transport capability is supplied per call
/// as a closure so the executor never constructs requests itself.
#[derive(Debug)]
pub struct CallExecutor<C: Clock = SystemClock> {
    policy: RetryPolicy,
    breaker: CircuitBreaker<C>,
    shutdown: CancellationToken,
}

impl CallExecutor<SystemClock> {
    /// Create an executor with a system-clock breaker.
    pub fn new(policy: RetryPolicy, breaker: CircuitBreaker<SystemClock>) -> Self {
        Self { policy, breaker, shutdown: CancellationToken::new() }
    }
}

impl<C: Clock> CallExecutor<C> {
    /// Create an executor around a breaker with a custom clock.
    pub fn with_breaker(policy: RetryPolicy, breaker: CircuitBreaker<C>) -> Self {
        Self { policy, breaker, shutdown: CancellationToken::new() }
    }

    /// Attach a shutdown token observed during backoff waits.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Access the owned circuit breaker (read-only).
    pub fn breaker(&self) -> &CircuitBreaker<C> {
        &self.breaker
    }

    /// Execute one logical call.
    ///
    /// Consults the breaker first: a blocked call fails immediately
    /// with no network attempt. Transport failures are retried up to
    /// `max_retries` additional times with exponential backoff; the
    /// backoff sleep is abandoned promptly when the shutdown token
    /// fires. An interrupted call records nothing on the breaker.
    pub async fn execute<F, Fut, T>(&mut self, mut call: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.breaker.before_call()?;

        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Ok(response) => {
                    if attempt > 0 {
                        debug!("Call succeeded after {} retries", attempt);
                    }
                    self.breaker.on_success();
                    return Ok(response);
                }
                Err(error) if attempt < self.policy.max_retries => {
                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        "Transport failure on attempt {} ({}), retrying in {:?}",
                        attempt + 1,
                        error,
                        delay
                    );
                    attempt += 1;
                    tokio::select! {
                        () = self.shutdown.cancelled() => return Err(CallError::Interrupted),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => {
                    let attempts = attempt + 1;
                    warn!("Call failed after {} attempts: {}", attempts, error);
                    self.breaker.on_failure();
                    return Err(CallError::RetriesExhausted { attempts, source: error });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use super::super::circuit_breaker::{BreakerState, CircuitBreakerConfig};
    use super::*;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .base_delay(Duration::from_millis(5))
            .backoff_factor(2.0)
            .build()
            .unwrap()
    }

    fn executor(max_retries: u32, failure_threshold: u32) -> CallExecutor {
        let config =
            CircuitBreakerConfig::builder().failure_threshold(failure_threshold).build().unwrap();
        CallExecutor::new(fast_policy(max_retries), CircuitBreaker::new(config))
    }

    /// Validates the exponential backoff schedule and its cap.
    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(100))
            .backoff_factor(2.0)
            .max_delay(Duration::from_millis(350))
            .build()
            .unwrap();

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350), "Capped at max_delay");
    }

    /// Validates policy validation rejects a shrinking backoff.
    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::builder().backoff_factor(0.5).build().is_err());
        assert!(RetryPolicy::builder().max_delay(Duration::ZERO).build().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    /// Tests a success after prior failed attempts reports exactly one
    /// success to the breaker and returns the value.
    #[tokio::test]
    async fn test_success_after_retries() {
        let mut exec = executor(3, 2);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = exec
            .execute(|| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TransportError::Connection("refused".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(exec.breaker().state(), BreakerState::Closed);
        assert_eq!(exec.breaker().failure_count(), 0, "Retries must not count as breaker failures");
    }

    /// Tests exhausting retries surfaces the final transport error and
    /// records a single breaker failure.
    #[tokio::test]
    async fn test_exhaustion_reports_one_breaker_failure() {
        let mut exec = executor(2, 5);

        let result: Result<(), _> = exec
            .execute(|| async { Err(TransportError::Connection("refused".into())) })
            .await;

        match result {
            Err(CallError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("Expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(exec.breaker().failure_count(), 1);
    }

    /// Tests an open breaker rejects the call without any network
    /// attempt.
    #[tokio::test]
    async fn test_open_breaker_blocks_without_attempt() {
        let mut exec = executor(0, 1);

        // One exhausted call opens the breaker (threshold 1).
        let _ = exec
            .execute(|| async { Err::<(), _>(TransportError::Connection("refused".into())) })
            .await;
        assert_eq!(exec.breaker().state(), BreakerState::Open);

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result = exec
            .execute(|| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                }
            })
            .await;

        assert!(matches!(result, Err(CallError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "No attempt may be made while open");
    }

    /// Tests a cancelled shutdown token aborts the backoff sleep
    /// promptly and reports nothing to the breaker.
    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let token = CancellationToken::new();
        let policy = RetryPolicy::builder()
            .max_retries(3)
            .base_delay(Duration::from_secs(60))
            .build()
            .unwrap();
        let mut exec = CallExecutor::new(policy, CircuitBreaker::with_defaults())
            .with_shutdown(token.clone());

        token.cancel();
        let started = Instant::now();
        let result: Result<(), _> = exec
            .execute(|| async { Err(TransportError::Timeout(Duration::from_millis(1))) })
            .await;

        assert!(matches!(result, Err(CallError::Interrupted)));
        assert!(started.elapsed() < Duration::from_secs(5), "Must not sit out the full backoff");
        assert_eq!(exec.breaker().failure_count(), 0);
    }
}
