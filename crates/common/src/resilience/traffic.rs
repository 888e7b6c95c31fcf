//! Traffic monitor: sliding-window backpressure from upstream
//! throttling
//!
//! Watches HTTP status codes across a time window and signals a pacing
//! cooldown once throttle-class responses pile up. Deliberately
//! independent of the circuit breaker: the breaker reacts to not
//! reaching the upstream at all, the monitor to the upstream explicitly
//! signalling overload while still reachable.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::{ConfigError, ConfigResult};

/// Status codes treated as upstream throttle/overload signals.
pub const THROTTLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Configuration for the traffic monitor
#[derive(Debug, Clone)]
pub struct TrafficMonitorConfig {
    /// Sliding window over which throttle responses are counted
    pub window: Duration,
    /// Number of windowed throttle responses that triggers a cooldown
    pub error_threshold: usize,
    /// How long to pause once the threshold trips (fixed, no
    /// escalation on repeated trips)
    pub cooldown: Duration,
}

impl Default for TrafficMonitorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            error_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl TrafficMonitorConfig {
    /// Create a configuration builder
    pub fn builder() -> TrafficMonitorConfigBuilder {
        TrafficMonitorConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.error_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "error_threshold must be greater than 0".to_string(),
            });
        }
        if self.window.is_zero() {
            return Err(ConfigError::Invalid {
                message: "window must be greater than zero".to_string(),
            });
        }
        if self.cooldown.is_zero() {
            return Err(ConfigError::Invalid {
                message: "cooldown must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for [`TrafficMonitorConfig`]
#[derive(Debug, Default)]
pub struct TrafficMonitorConfigBuilder {
    config: TrafficMonitorConfig,
}

impl TrafficMonitorConfigBuilder {
    pub fn new() -> Self {
        Self { config: TrafficMonitorConfig::default() }
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    pub fn error_threshold(mut self, threshold: usize) -> Self {
        self.config.error_threshold = threshold;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    pub fn build(self) -> ConfigResult<TrafficMonitorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Sliding-window monitor of throttle-class responses.
///
/// Timestamps are held in insertion (chronological) order and pruned
/// against the window before every insert and every read, so stale
/// errors never count toward the threshold.
#[derive(Debug)]
pub struct TrafficMonitor<C: Clock = SystemClock> {
    config: TrafficMonitorConfig,
    errors: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
    clock: C,
}

impl TrafficMonitor<SystemClock> {
    /// Create a monitor using the system clock.
    pub fn new(config: TrafficMonitorConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }

    /// Create a monitor with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(TrafficMonitorConfig::default())
    }
}

impl Default for TrafficMonitor<SystemClock> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<C: Clock> TrafficMonitor<C> {
    /// Create a monitor with a custom clock (useful for testing).
    pub fn with_clock(config: TrafficMonitorConfig, clock: C) -> Self {
        Self { config, errors: VecDeque::new(), cooldown_until: None, clock }
    }

    /// Whether a status code counts as a throttle signal.
    pub fn is_throttle_status(status: u16) -> bool {
        THROTTLE_STATUSES.contains(&status)
    }

    /// Record a response outcome.
    ///
    /// Non-throttle statuses are ignored. A throttle status is stamped
    /// into the window; if the windowed count reaches the threshold,
    /// the cooldown is (re-)armed from now.
    pub fn on_response(&mut self, status: u16) {
        if !Self::is_throttle_status(status) {
            return;
        }

        let now = self.clock.now();
        self.prune(now);
        self.errors.push_back(now);

        if self.errors.len() >= self.config.error_threshold {
            self.cooldown_until = Some(now + self.config.cooldown);
            warn!(
                "Traffic monitor tripped: {} throttle responses within {:?}, pausing for {:?}",
                self.errors.len(),
                self.config.window,
                self.config.cooldown
            );
        } else {
            debug!(
                "Throttle response {} recorded ({}/{} within window)",
                status,
                self.errors.len(),
                self.config.error_threshold
            );
        }
    }

    /// Whether callers should pause before the next request.
    pub fn should_pause(&mut self) -> bool {
        self.pause_remaining().is_some()
    }

    /// Time left in the current cooldown, if any.
    pub fn pause_remaining(&mut self) -> Option<Duration> {
        let now = self.clock.now();
        self.prune(now);
        match self.cooldown_until {
            Some(until) if until > now => Some(until - now),
            _ => None,
        }
    }

    /// Number of throttle responses currently inside the window.
    pub fn recent_errors(&mut self) -> usize {
        let now = self.clock.now();
        self.prune(now);
        self.errors.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.errors.front() {
            if now.duration_since(*oldest) > self.config.window {
                self.errors.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::clock::MockClock;
    use super::*;

    fn monitor(
        window: Duration,
        threshold: usize,
        cooldown: Duration,
        clock: MockClock,
    ) -> TrafficMonitor<MockClock> {
        let config = TrafficMonitorConfig::builder()
            .window(window)
            .error_threshold(threshold)
            .cooldown(cooldown)
            .build()
            .unwrap();
        TrafficMonitor::with_clock(config, clock)
    }

    /// Validates the throttle status classification.
    #[test]
    fn test_throttle_status_classification() {
        for status in THROTTLE_STATUSES {
            assert!(TrafficMonitor::<MockClock>::is_throttle_status(status));
        }
        for status in [200, 201, 301, 400, 401, 404, 501] {
            assert!(!TrafficMonitor::<MockClock>::is_throttle_status(status));
        }
    }

    /// Validates config validation rejects zero thresholds and
    /// durations.
    #[test]
    fn test_config_validation() {
        assert!(TrafficMonitorConfig::default().validate().is_ok());
        assert!(TrafficMonitorConfig::builder().error_threshold(0).build().is_err());
        assert!(TrafficMonitorConfig::builder().window(Duration::ZERO).build().is_err());
        assert!(TrafficMonitorConfig::builder().cooldown(Duration::ZERO).build().is_err());
    }

    /// Tests no pause is signalled below the threshold, then a pause
    /// lasting exactly the cooldown after the tripping response.
    #[test]
    fn test_cooldown_trips_at_threshold() {
        let clock = MockClock::new();
        let mut tm = monitor(Duration::from_secs(60), 3, Duration::from_secs(30), clock.clone());

        tm.on_response(429);
        tm.on_response(503);
        assert!(!tm.should_pause(), "Below threshold there is no cooldown");

        tm.on_response(429);
        assert!(tm.should_pause(), "Threshold reached, cooldown armed");
        assert_eq!(tm.pause_remaining(), Some(Duration::from_secs(30)));

        clock.advance(Duration::from_secs(29));
        assert!(tm.should_pause());

        clock.advance(Duration::from_secs(2));
        assert!(!tm.should_pause(), "Cooldown expired");
    }

    /// Tests successful and non-throttle statuses never count.
    #[test]
    fn test_ignores_non_throttle_statuses() {
        let mut tm =
            monitor(Duration::from_secs(60), 2, Duration::from_secs(30), MockClock::new());

        tm.on_response(200);
        tm.on_response(404);
        tm.on_response(200);
        assert_eq!(tm.recent_errors(), 0);
        assert!(!tm.should_pause());
    }

    /// Tests errors older than the window are pruned and never count
    /// toward the threshold.
    #[test]
    fn test_window_pruning() {
        let clock = MockClock::new();
        let mut tm = monitor(Duration::from_secs(10), 3, Duration::from_secs(30), clock.clone());

        tm.on_response(429);
        tm.on_response(429);
        clock.advance(Duration::from_secs(11));
        assert_eq!(tm.recent_errors(), 0, "Stale errors pruned on read");

        tm.on_response(429);
        assert!(!tm.should_pause(), "Stale errors must not combine with fresh ones");
    }

    /// Tests a repeated trip re-arms the same fixed cooldown from the
    /// tripping response.
    #[test]
    fn test_repeated_trip_rearms_fixed_cooldown() {
        let clock = MockClock::new();
        let mut tm = monitor(Duration::from_secs(60), 2, Duration::from_secs(20), clock.clone());

        tm.on_response(429);
        tm.on_response(429);
        assert_eq!(tm.pause_remaining(), Some(Duration::from_secs(20)));

        clock.advance(Duration::from_secs(15));
        tm.on_response(502);
        assert_eq!(
            tm.pause_remaining(),
            Some(Duration::from_secs(20)),
            "Cooldown restarts, it does not escalate"
        );
    }
}
