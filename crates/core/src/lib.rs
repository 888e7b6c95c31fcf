//! # Pacekeeper Core
//!
//! Orchestration layer of the resilience core: drives long paginated
//! fetch loops against a rate-limiting upstream and supervises the
//! worker processes running them.
//!
//! This crate composes the primitives from `pacekeeper-common`:
//!
//! - [`fetch`]: resumable paginated fetch loop with pacing, partial
//!   results, and checkpointed progress.
//! - [`supervisor`]: child-process lifecycle (start/stop/liveness/
//!   orphan cleanup) plus the background memory watchdog.
//! - [`supervise`]: outer crash/backoff loop around a unit of work.
//!
//! External collaborators (HTTP transports, page sources, worker
//! binaries) are consumed through traits and command specs; nothing in
//! here builds requests or parses responses.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod fetch;
pub mod supervise;
pub mod supervisor;

pub use fetch::{ChunkFetcher, FetchError, FetchOptions, FetchOutcome, Page, PageSource, StopReason};
pub use supervise::{supervise, SupervisionOutcome, SupervisionPolicy};
pub use supervisor::{
    MemoryWatchdog, Supervisor, SupervisorConfig, SupervisorError, WatchdogConfig, WorkerHandle,
};
