//! Child worker process lifecycle
//!
//! The supervisor owns a lock-guarded handle table that is the single
//! source of truth for "what is currently running": one live handle
//! per worker name, inserted on start, removed on stop or on lazy
//! crash detection. The table is the only state shared with the
//! background memory watchdog, and the watchdog tears workers down
//! through the same [`Supervisor::stop`] entry point as everyone else.

mod watchdog;

pub use watchdog::{MemoryWatchdog, WatchdogConfig};

use std::collections::{HashMap, HashSet};
use std::io;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Errors raised by supervisor operations. Never silently swallowed;
/// the caller decides what is best-effort.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker '{name}' is already running (pid {pid})")]
    AlreadyRunning { name: String, pid: u32 },

    #[error("failed to spawn worker '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to terminate worker '{name}': {source}")]
    Terminate {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Configuration for supervisor behavior
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a stopped worker gets to exit gracefully before it is
    /// forcibly killed
    pub grace_period: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { grace_period: Duration::from_secs(5) }
    }
}

/// Identity of a live worker process.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// Unique worker name (at most one live handle per name)
    pub name: String,
    /// OS process id
    pub pid: u32,
    /// When the worker was spawned
    pub started_at: Instant,
}

struct WorkerEntry {
    handle: WorkerHandle,
    child: Child,
}

/// Supervises named child worker processes.
///
/// `is_running` polls real process liveness and self-heals the table:
/// a handle whose process has exited is removed on the next check
/// rather than via an exit callback.
pub struct Supervisor {
    config: SupervisorConfig,
    workers: Mutex<HashMap<String, WorkerEntry>>,
}

impl Supervisor {
    /// Create a supervisor with the given configuration.
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config, workers: Mutex::new(HashMap::new()) }
    }

    /// Create a supervisor with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(SupervisorConfig::default())
    }

    /// Launch a worker process under the given unique name.
    ///
    /// Fails with [`SupervisorError::AlreadyRunning`] if a live handle
    /// exists for the name; a stale handle for an exited process is
    /// healed first instead of blocking the start.
    pub fn start(
        &self,
        name: &str,
        command: &str,
        args: &[String],
    ) -> Result<WorkerHandle, SupervisorError> {
        let mut workers = self.workers.lock();

        if let Some(entry) = workers.get_mut(name) {
            match entry.child.try_wait() {
                Ok(None) => {
                    return Err(SupervisorError::AlreadyRunning {
                        name: name.to_string(),
                        pid: entry.handle.pid,
                    });
                }
                Ok(Some(status)) => {
                    warn!("Removing stale handle for '{}' (exited with {})", name, status);
                    workers.remove(name);
                }
                Err(err) => {
                    warn!("Liveness probe for '{}' failed ({}), removing handle", name, err);
                    workers.remove(name);
                }
            }
        }

        let child = Command::new(command)
            .args(args)
            .spawn()
            .map_err(|source| SupervisorError::Spawn { name: name.to_string(), source })?;

        let pid = child.id().unwrap_or_default();
        let handle =
            WorkerHandle { name: name.to_string(), pid, started_at: Instant::now() };
        info!("Started worker '{}' (pid {})", name, pid);
        workers.insert(name.to_string(), WorkerEntry { handle: handle.clone(), child });
        Ok(handle)
    }

    /// Whether the named worker is currently alive.
    ///
    /// Actively polls the process; a handle for an exited process is
    /// lazily removed here.
    pub fn is_running(&self, name: &str) -> bool {
        let mut workers = self.workers.lock();
        let Some(entry) = workers.get_mut(name) else {
            return false;
        };
        match entry.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!("Worker '{}' exited with {}, removing handle", name, status);
                workers.remove(name);
                false
            }
            Err(err) => {
                warn!("Liveness probe for '{}' failed ({}), removing handle", name, err);
                workers.remove(name);
                false
            }
        }
    }

    /// Stop the named worker: request graceful termination, wait up to
    /// the grace period, then forcibly kill.
    ///
    /// The handle is removed on every path. Returns whether a live
    /// worker was actually stopped.
    pub async fn stop(&self, name: &str) -> Result<bool, SupervisorError> {
        // Take ownership of the entry up front so the handle is gone
        // regardless of which termination path succeeds, and so the
        // lock is never held across an await.
        let entry = self.workers.lock().remove(name);
        let Some(mut entry) = entry else {
            debug!("Stop requested for unknown worker '{}'", name);
            return Ok(false);
        };

        if let Ok(Some(status)) = entry.child.try_wait() {
            debug!("Worker '{}' already exited with {}", name, status);
            return Ok(false);
        }

        if send_term(entry.handle.pid) {
            match tokio::time::timeout(self.config.grace_period, entry.child.wait()).await {
                Ok(Ok(status)) => {
                    info!("Worker '{}' exited gracefully with {}", name, status);
                    return Ok(true);
                }
                Ok(Err(err)) => {
                    return Err(SupervisorError::Terminate { name: name.to_string(), source: err });
                }
                Err(_elapsed) => {
                    warn!("Worker '{}' ignored graceful stop, killing", name);
                }
            }
        }

        if let Err(err) = entry.child.start_kill() {
            // The worker may have exited between the probe and the kill.
            if matches!(entry.child.try_wait(), Ok(Some(_))) {
                return Ok(true);
            }
            return Err(SupervisorError::Terminate { name: name.to_string(), source: err });
        }
        match entry.child.wait().await {
            Ok(status) => {
                info!("Worker '{}' killed ({})", name, status);
                Ok(true)
            }
            Err(err) => Err(SupervisorError::Terminate { name: name.to_string(), source: err }),
        }
    }

    /// Snapshot of currently tracked workers (for the watchdog and
    /// operator-facing listings). Does not probe liveness.
    pub fn running_workers(&self) -> Vec<WorkerHandle> {
        self.workers.lock().values().map(|entry| entry.handle.clone()).collect()
    }

    /// Terminate worker-like host processes that are not in the handle
    /// table.
    ///
    /// Scans all host processes for command lines containing
    /// `signature` and kills those that are neither tracked nor this
    /// process. Protects against handles lost across supervisor
    /// restarts. Returns how many orphans were terminated.
    pub fn cleanup_orphans(&self, signature: &str) -> usize {
        let tracked: HashSet<u32> =
            self.workers.lock().values().map(|entry| entry.handle.pid).collect();
        let own_pid = sysinfo::get_current_pid().ok();

        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut killed = 0;
        for (pid, process) in system.processes() {
            if tracked.contains(&pid.as_u32()) || Some(*pid) == own_pid {
                continue;
            }
            let cmdline = process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            if !cmdline.contains(signature) {
                continue;
            }
            warn!("Terminating orphaned worker process {} ({})", pid.as_u32(), cmdline);
            if process.kill() {
                killed += 1;
            }
        }
        if killed > 0 {
            info!("Cleaned up {} orphaned worker process(es)", killed);
        }
        killed
    }

    /// Resident memory in bytes for each tracked worker, sampled from
    /// the host process table.
    pub(crate) fn sample_memory(&self, system: &mut System) -> Vec<(WorkerHandle, u64)> {
        let handles = self.running_workers();
        let pids: Vec<Pid> = handles.iter().map(|h| Pid::from_u32(h.pid)).collect();
        if pids.is_empty() {
            return Vec::new();
        }
        system.refresh_processes(ProcessesToUpdate::Some(&pids), true);
        handles
            .into_iter()
            .filter_map(|handle| {
                let memory = system.process(Pid::from_u32(handle.pid))?.memory();
                Some((handle, memory))
            })
            .collect()
    }
}

/// Request graceful termination via SIGTERM. Returns false when the
/// signal is unsupported on the platform or the process is already
/// gone, in which case the caller falls through to a forcible kill.
fn send_term(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|process| process.kill_with(Signal::Term).unwrap_or(false))
        .unwrap_or(false)
}
