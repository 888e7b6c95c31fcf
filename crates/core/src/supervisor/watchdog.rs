//! Background memory watchdog
//!
//! A periodic tokio task that samples resident memory for every
//! tracked worker and stops any worker exceeding the configured limit.
//! It only *requests* the stop through [`Supervisor::stop`], so there
//! is exactly one teardown code path. Whether a stopped worker is
//! restarted is the outer supervision layer's decision.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Supervisor;
use pacekeeper_common::resilience::{ConfigError, ConfigResult};

/// Configuration for the memory watchdog
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Fixed sampling interval
    pub interval: Duration,
    /// Resident memory budget per worker, in bytes
    pub memory_limit_bytes: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(30), memory_limit_bytes: 512 * 1024 * 1024 }
    }
}

impl WatchdogConfig {
    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid {
                message: "interval must be greater than zero".to_string(),
            });
        }
        if self.memory_limit_bytes == 0 {
            return Err(ConfigError::Invalid {
                message: "memory_limit_bytes must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Handle to a running memory watchdog task.
pub struct MemoryWatchdog {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl MemoryWatchdog {
    /// Spawn the watchdog over the given supervisor's handle table.
    pub fn spawn(supervisor: Arc<Supervisor>, config: WatchdogConfig) -> ConfigResult<Self> {
        config.validate()?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(supervisor, config, shutdown.clone()));
        Ok(Self { shutdown, task })
    }

    /// Stop the watchdog and wait for the task to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            warn!("Watchdog task ended abnormally: {}", err);
        }
    }

    /// Whether the background task has finished.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn run(supervisor: Arc<Supervisor>, config: WatchdogConfig, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut system = System::new();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!("Memory watchdog shutting down");
                return;
            }
            _ = ticker.tick() => {}
        }

        for (handle, memory) in supervisor.sample_memory(&mut system) {
            if memory <= config.memory_limit_bytes {
                continue;
            }
            warn!(
                "Worker '{}' (pid {}) resident memory {} exceeds limit {}, stopping",
                handle.name, handle.pid, memory, config.memory_limit_bytes
            );
            match supervisor.stop(&handle.name).await {
                Ok(stopped) => {
                    debug!("Watchdog stop of '{}' completed (stopped: {})", handle.name, stopped);
                }
                Err(err) => {
                    warn!("Watchdog failed to stop '{}': {}", handle.name, err);
                }
            }
        }
    }
}
