//! Resilience primitives and checkpoint persistence shared across
//! pacekeeper crates.
//!
//! This crate holds the leaf components of the resilience core:
//!
//! - [`resilience`]: circuit breaker, retrying call executor, and the
//!   sliding-window traffic monitor that paces calls against a
//!   rate-limiting upstream.
//! - [`checkpoint`]: crash-safe persistence of per-profile progress so
//!   a restarted worker resumes exactly where it left off.
//!
//! Nothing here spawns processes or constructs network requests; the
//! orchestration layer (`pacekeeper-core`) composes these primitives
//! around external transport and page-source collaborators.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod checkpoint;
pub mod resilience;

pub use checkpoint::{CheckpointState, CheckpointStore, PersistenceError};
pub use resilience::{
    CallError, CallExecutor, CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, Clock,
    MockClock, RetryPolicy, SystemClock, TrafficMonitor, TrafficMonitorConfig, TransportError,
};
