//! Paginated fetch loop with pacing, partial results, and checkpointed
//! progress
//!
//! Drives repeated page fetches through the resilient call executor,
//! honoring traffic-monitor cooldowns before every page. Errors on a
//! later page never discard already-accumulated items: the loop exits
//! with partial results and the last good cursor, which is enough to
//! resume.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use pacekeeper_common::checkpoint::{CheckpointState, CheckpointStore, PersistenceError};
use pacekeeper_common::resilience::{
    CallError, CallExecutor, Clock, ConfigError, ConfigResult, SystemClock, TrafficMonitor,
    TransportError,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the cooldown wait re-checks the monitor and the shutdown
/// token. Keeps the stop signal observable within a sub-second bound.
const COOLDOWN_POLL: Duration = Duration::from_millis(250);

/// Minimum pause before re-attempting a throttled cursor, applied even
/// while the monitor is still below its threshold. A throttling
/// upstream is never hit back-to-back.
const THROTTLE_REATTEMPT_PAUSE: Duration = Duration::from_millis(100);

/// One page of upstream results. Items are opaque to the loop.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// HTTP status the upstream answered with
    pub status: u16,
    /// Items on this page (empty on throttle/error statuses)
    pub items: Vec<T>,
    /// Opaque resumption token for the page after this one
    pub next_cursor: Option<String>,
    /// Whether the upstream reports further pages
    pub has_more: bool,
}

/// External "fetch one page given a cursor" capability.
///
/// Implementations own URL construction, headers, and response
/// decoding; the loop only interprets the status code and the paging
/// envelope.
#[async_trait]
pub trait PageSource: Send + Sync {
    type Item: Send;

    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Page<Self::Item>, TransportError>;
}

/// Bounds for one chunked fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Items requested per page
    pub chunk_limit: u32,
    /// Hard bound on pages fetched in this chunk
    pub max_pages: u32,
    /// Optional bound on total accumulated items
    pub max_items: Option<usize>,
    /// Hard bound on consecutive throttled re-attempts of one cursor
    pub max_throttle_retries: u32,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self { chunk_limit: 50, max_pages: 20, max_items: None, max_throttle_retries: 10 }
    }
}

impl FetchOptions {
    pub fn new(chunk_limit: u32, max_pages: u32) -> Self {
        Self { chunk_limit, max_pages, ..Self::default() }
    }

    #[must_use]
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    #[must_use]
    pub fn with_max_throttle_retries(mut self, retries: u32) -> Self {
        self.max_throttle_retries = retries;
        self
    }

    /// Validate the options
    pub fn validate(&self) -> ConfigResult<()> {
        if self.chunk_limit == 0 {
            return Err(ConfigError::Invalid {
                message: "chunk_limit must be greater than 0".to_string(),
            });
        }
        if self.max_pages == 0 {
            return Err(ConfigError::Invalid {
                message: "max_pages must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Terminal errors translated into a loop exit with partial results.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The resilient call executor gave up on a page fetch.
    #[error(transparent)]
    Call(#[from] CallError),

    /// The upstream answered with a non-throttle error status that
    /// pacing cannot fix.
    #[error("upstream rejected the request with status {status}")]
    UpstreamStatus { status: u16 },

    /// The upstream throttled every paced re-attempt of the same
    /// cursor until the per-chunk budget ran out.
    #[error("upstream throttled {count} consecutive attempts for the same cursor")]
    PersistentThrottle { count: u32 },

    /// The fetch options failed validation; nothing was fetched.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Progress could not be checkpointed; the last good on-disk state
    /// is intact.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Why the loop stopped. Every exit is distinguishable to the caller.
#[derive(Debug)]
pub enum StopReason {
    /// The upstream reported no further pages
    Drained,
    /// Accumulated items reached the requested overall limit
    ItemLimit,
    /// `max_pages` pages were fetched
    PageBudget,
    /// A page fetch or checkpoint write failed; partial results kept
    Failed(FetchError),
    /// The shutdown signal fired at a suspension point
    Interrupted,
}

/// Result of one chunked fetch.
#[derive(Debug)]
pub struct FetchOutcome<T> {
    /// Everything accumulated before the loop stopped
    pub items: Vec<T>,
    /// Cursor to resume from (the last good cursor on failure)
    pub cursor: Option<String>,
    /// False only when the upstream was drained
    pub has_more: bool,
    /// Pages successfully fetched in this chunk
    pub pages_fetched: u32,
    /// Why the loop stopped
    pub stop: StopReason,
}

/// Drives a resumable paginated fetch through the executor and
/// monitor, checkpointing progress between pages.
#[derive(Debug)]
pub struct ChunkFetcher<C: Clock = SystemClock> {
    executor: CallExecutor<C>,
    monitor: TrafficMonitor<C>,
    checkpoints: Option<(CheckpointStore, String, String)>,
    shutdown: CancellationToken,
}

impl<C: Clock> ChunkFetcher<C> {
    /// Create a fetcher from its resilience collaborators.
    pub fn new(executor: CallExecutor<C>, monitor: TrafficMonitor<C>) -> Self {
        Self { executor, monitor, checkpoints: None, shutdown: CancellationToken::new() }
    }

    /// Record progress into `store` under the given profile identity
    /// and action name after every successful page.
    #[must_use]
    pub fn with_checkpoints(
        mut self,
        store: CheckpointStore,
        profile: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        self.checkpoints = Some((store, profile.into(), action.into()));
        self
    }

    /// Attach a shutdown token observed at every suspension point.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.executor = self.executor.with_shutdown(shutdown.clone());
        self.shutdown = shutdown;
        self
    }

    /// Fetch up to `max_pages` pages starting from `cursor`.
    ///
    /// Before each page the monitor is consulted; an active cooldown is
    /// slept out in bounded slices, re-checking both the cooldown and
    /// the shutdown token. Throttle-class statuses feed the monitor and
    /// re-attempt the same cursor after pacing, bounded by
    /// `max_throttle_retries` consecutive re-attempts; other error
    /// statuses and executor errors are terminal with partial results.
    pub async fn fetch_chunk<S: PageSource>(
        &mut self,
        source: &S,
        cursor: Option<String>,
        options: &FetchOptions,
    ) -> FetchOutcome<S::Item> {
        if let Err(err) = options.validate() {
            return outcome(Vec::new(), cursor, true, 0, StopReason::Failed(err.into()));
        }

        let mut items: Vec<S::Item> = Vec::new();
        let mut cursor = cursor;
        let mut pages_fetched: u32 = 0;
        let mut consecutive_throttles: u32 = 0;

        loop {
            if self.wait_for_cooldown().await.is_err() {
                return outcome(items, cursor, true, pages_fetched, StopReason::Interrupted);
            }

            let result = self
                .executor
                .execute(|| source.fetch_page(cursor.as_deref(), options.chunk_limit))
                .await;

            let page = match result {
                Ok(page) => page,
                Err(CallError::Interrupted) => {
                    info!("Fetch loop interrupted after {} pages", pages_fetched);
                    return outcome(items, cursor, true, pages_fetched, StopReason::Interrupted);
                }
                Err(err) => {
                    warn!("Fetch loop stopping after {} pages: {}", pages_fetched, err);
                    return outcome(
                        items,
                        cursor,
                        true,
                        pages_fetched,
                        StopReason::Failed(err.into()),
                    );
                }
            };

            self.monitor.on_response(page.status);

            if TrafficMonitor::<C>::is_throttle_status(page.status) {
                consecutive_throttles += 1;
                if consecutive_throttles > options.max_throttle_retries {
                    warn!(
                        "Upstream throttled {} consecutive attempts, stopping",
                        consecutive_throttles
                    );
                    return outcome(
                        items,
                        cursor,
                        true,
                        pages_fetched,
                        StopReason::Failed(FetchError::PersistentThrottle {
                            count: consecutive_throttles,
                        }),
                    );
                }
                // Same cursor is re-attempted once pacing allows.
                debug!(
                    "Throttled with status {}, holding cursor ({}/{})",
                    page.status, consecutive_throttles, options.max_throttle_retries
                );
                tokio::select! {
                    () = self.shutdown.cancelled() => {
                        return outcome(items, cursor, true, pages_fetched, StopReason::Interrupted);
                    }
                    () = tokio::time::sleep(THROTTLE_REATTEMPT_PAUSE) => {}
                }
                continue;
            }
            consecutive_throttles = 0;

            if !(200..300).contains(&page.status) {
                warn!("Upstream rejected page fetch with status {}", page.status);
                return outcome(
                    items,
                    cursor,
                    true,
                    pages_fetched,
                    StopReason::Failed(FetchError::UpstreamStatus { status: page.status }),
                );
            }

            pages_fetched += 1;
            cursor = page.next_cursor;
            items.extend(page.items);
            debug!("Fetched page {} ({} items total)", pages_fetched, items.len());

            if let Err(err) = self.record_progress(pages_fetched, options.max_pages).await {
                warn!("Checkpoint write failed, stopping with partial results: {}", err);
                return outcome(items, cursor, true, pages_fetched, StopReason::Failed(err.into()));
            }

            if !page.has_more {
                return outcome(items, cursor, false, pages_fetched, StopReason::Drained);
            }
            if let Some(max_items) = options.max_items {
                if items.len() >= max_items {
                    return outcome(items, cursor, true, pages_fetched, StopReason::ItemLimit);
                }
            }
            if pages_fetched >= options.max_pages {
                return outcome(items, cursor, true, pages_fetched, StopReason::PageBudget);
            }
        }
    }

    /// Sleep out an active cooldown in bounded slices, never silently
    /// dropping it. `Err(())` means the shutdown token fired.
    async fn wait_for_cooldown(&mut self) -> Result<(), ()> {
        while let Some(remaining) = self.monitor.pause_remaining() {
            let nap = remaining.min(COOLDOWN_POLL);
            debug!("Cooldown active, {:?} remaining", remaining);
            tokio::select! {
                () = self.shutdown.cancelled() => return Err(()),
                () = tokio::time::sleep(nap) => {}
            }
        }
        Ok(())
    }

    /// Checkpoint writes are synchronous (and may sleep on a contended
    /// replace), so they run off the async worker thread.
    async fn record_progress(
        &self,
        pages_fetched: u32,
        max_pages: u32,
    ) -> Result<(), PersistenceError> {
        let Some((store, profile, action)) = &self.checkpoints else {
            return Ok(());
        };
        let progress = f64::from(pages_fetched) / f64::from(max_pages.max(1)) * 100.0;
        let store = store.clone();
        let state = CheckpointState::new(profile.clone(), action.clone(), progress);
        match tokio::task::spawn_blocking(move || store.save(&state)).await {
            Ok(result) => result,
            Err(err) => Err(PersistenceError::Io(io::Error::other(err))),
        }
    }
}

fn outcome<T>(
    items: Vec<T>,
    cursor: Option<String>,
    has_more: bool,
    pages_fetched: u32,
    stop: StopReason,
) -> FetchOutcome<T> {
    FetchOutcome { items, cursor, has_more, pages_fetched, stop }
}
