//! Outer supervision loop: re-run crashing work with exponential
//! backoff
//!
//! Wraps a unit of work that may fail or crash. A clean exit ends
//! supervision immediately with success; failures are retried after
//! `base_delay * 2^attempt` up to a hard attempt ceiling, leaving the
//! last checkpoint intact on exhaustion so the operator can diagnose
//! or resume manually. An external stop signal aborts immediately and
//! is a clean stop, not a failure.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pacekeeper_common::resilience::{ConfigError, ConfigResult};

/// Policy for the crash/backoff loop.
#[derive(Debug, Clone)]
pub struct SupervisionPolicy {
    /// Total attempts before giving up
    pub max_retries: u32,
    /// Backoff after the first failure
    pub base_delay: Duration,
    /// Multiplier per consecutive failure
    pub backoff_factor: u32,
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay: Duration::from_secs(1), backoff_factor: 2 }
    }
}

impl SupervisionPolicy {
    /// Validate the policy
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid {
                message: "max_retries must be greater than 0".to_string(),
            });
        }
        if self.backoff_factor == 0 {
            return Err(ConfigError::Invalid {
                message: "backoff_factor must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Backoff delay after the given 0-based consecutive failure.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// How a supervised run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisionOutcome {
    /// The work exited cleanly
    Completed,
    /// Every attempt failed; the last checkpoint is left intact
    Exhausted { attempts: u32, last_error: String },
    /// The external stop signal fired (clean stop, not a failure)
    Interrupted,
}

impl SupervisionOutcome {
    /// Process exit code surfaced to the operator layer.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisionOutcome::Completed | SupervisionOutcome::Interrupted => 0,
            SupervisionOutcome::Exhausted { .. } => 1,
        }
    }

    /// Whether the run is considered a clean stop.
    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }
}

/// Run `work` under crash/backoff supervision.
///
/// `work` receives the 0-based attempt number. The shutdown token is
/// observed both between attempts and during backoff waits, and racing
/// it against the running attempt means an interrupt never waits for a
/// hung unit of work.
pub async fn supervise<F, Fut, E>(
    policy: &SupervisionPolicy,
    shutdown: &CancellationToken,
    mut work: F,
) -> SupervisionOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    let mut last_error = String::new();

    for attempt in 0..policy.max_retries {
        if shutdown.is_cancelled() {
            info!("Supervision interrupted before attempt {}", attempt + 1);
            return SupervisionOutcome::Interrupted;
        }

        let result = tokio::select! {
            () = shutdown.cancelled() => {
                info!("Supervision interrupted during attempt {}", attempt + 1);
                return SupervisionOutcome::Interrupted;
            }
            result = work(attempt) => result,
        };

        match result {
            Ok(()) => {
                if attempt > 0 {
                    info!("Supervised work recovered after {} failed attempt(s)", attempt);
                }
                return SupervisionOutcome::Completed;
            }
            Err(err) => {
                warn!(
                    "Supervised work failed on attempt {}/{}: {}",
                    attempt + 1,
                    policy.max_retries,
                    err
                );
                last_error = err.to_string();

                if attempt + 1 < policy.max_retries {
                    let delay = policy.delay_for(attempt);
                    tokio::select! {
                        () = shutdown.cancelled() => return SupervisionOutcome::Interrupted,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    warn!("Supervision exhausted after {} attempts", policy.max_retries);
    SupervisionOutcome::Exhausted { attempts: policy.max_retries, last_error }
}
