//! Sliding-window rate limiting with exponential back-off.
//!
//! Every outbound provider call goes through one [`RateLimiter`] owned by the
//! [`ProviderManager`](crate::ProviderManager). The limiter keeps a deque of
//! request timestamps inside the configured window; when the window is full,
//! [`acquire`](RateLimiter::acquire) suspends the caller with a delay that
//! doubles on each consecutive throttle until it caps at
//! [`max_delay_ms`](RateLimitConfig::max_delay_ms).
//!
//! # Example
//!
//! ```rust
//! use devflow::rate_limiter::{RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! assert!(limiter.try_acquire());
//! assert_eq!(limiter.stats().total_requests, 1);
//! ```

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Exponent clamp applied before the back-off shift. Delays cap at
/// `max_delay_ms` long before this, the clamp only keeps the shift itself
/// from overflowing.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Validated limiter configuration.
///
/// Construct with [`RateLimitConfig::new`], which rejects out-of-range
/// values, or use [`Default`] (60 requests over a 60 s window, 500 ms base
/// delay capped at 30 s).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum requests admitted per sliding window.
    pub max_requests_per_minute: u32,
    /// Window length in seconds.
    pub window_seconds: u64,
    /// First back-off delay in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for the back-off delay.
    pub max_delay_ms: u64,
    /// When false, both acquire paths admit immediately (but still count).
    pub enabled: bool,
}

impl RateLimitConfig {
    /// Build a config, validating every field.
    ///
    /// # Example
    ///
    /// ```rust
    /// use devflow::rate_limiter::RateLimitConfig;
    ///
    /// assert!(RateLimitConfig::new(10, 60, 500, 2000, true).is_ok());
    /// assert!(RateLimitConfig::new(0, 60, 500, 2000, true).is_err());
    /// assert!(RateLimitConfig::new(10, 60, 500, 100, true).is_err());
    /// ```
    pub fn new(
        max_requests_per_minute: u32,
        window_seconds: u64,
        base_delay_ms: u64,
        max_delay_ms: u64,
        enabled: bool,
    ) -> Result<Self, RateLimitError> {
        let config = Self {
            max_requests_per_minute,
            window_seconds,
            base_delay_ms,
            max_delay_ms,
            enabled,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), RateLimitError> {
        let mut reasons = Vec::new();
        if self.max_requests_per_minute == 0 {
            reasons.push("max_requests_per_minute must be > 0");
        }
        if self.window_seconds == 0 {
            reasons.push("window_seconds must be > 0");
        }
        if self.base_delay_ms == 0 {
            reasons.push("base_delay_ms must be > 0");
        }
        if self.max_delay_ms < self.base_delay_ms {
            reasons.push("max_delay_ms must be >= base_delay_ms");
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(RateLimitError::InvalidConfig(reasons.join("; ")))
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 60,
            window_seconds: 60,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            enabled: true,
        }
    }
}

/// Snapshot of the limiter's counters, taken atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStats {
    pub total_requests: u64,
    pub throttled_requests: u64,
    /// Requests currently inside the sliding window.
    pub window_count: usize,
    /// Permits left before the window is full.
    pub remaining: u32,
    /// Mean back-off wait per throttled request, 0 when nothing throttled.
    pub average_wait_ms: f64,
    pub consecutive_throttles: u32,
    pub total_wait_ms: u64,
}

#[derive(Debug, Clone)]
pub enum RateLimitError {
    InvalidConfig(String),
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::InvalidConfig(reasons) => {
                write!(f, "Invalid rate limit config: {}", reasons)
            }
        }
    }
}

impl Error for RateLimitError {}

struct LimiterState {
    timestamps: VecDeque<Instant>,
    total_requests: u64,
    throttled_requests: u64,
    total_wait_ms: u64,
    consecutive_throttles: u32,
    config: RateLimitConfig,
}

impl LimiterState {
    fn prune(&mut self, now: Instant) {
        let window = Duration::from_secs(self.config.window_seconds);
        while let Some(oldest) = self.timestamps.front() {
            if now.duration_since(*oldest) > window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, now: Instant) {
        self.timestamps.push_back(now);
        self.total_requests += 1;
    }
}

/// Thread-safe sliding-window limiter.
///
/// All mutation happens under a single internal mutex, which is what makes
/// the admission decision atomic: with `N` concurrent
/// [`try_acquire`](RateLimiter::try_acquire) callers and limit `L`, exactly
/// `min(N, L)` of them are admitted. The mutex is never held across the
/// back-off sleep.
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                timestamps: VecDeque::new(),
                total_requests: 0,
                throttled_requests: 0,
                total_wait_ms: 0,
                consecutive_throttles: 0,
                config,
            }),
        }
    }

    /// Non-blocking admission check.
    ///
    /// Records the request and returns `true` when the limiter is disabled or
    /// the window has room; returns `false` otherwise without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        if !state.config.enabled {
            state.record(now);
            return true;
        }
        state.prune(now);
        if (state.timestamps.len() as u32) < state.config.max_requests_per_minute {
            state.record(now);
            true
        } else {
            false
        }
    }

    /// Admission with suspension.
    ///
    /// When the window is full the caller sleeps for
    /// `min(base_delay_ms * 2^(n-1), max_delay_ms)` where `n` is the number
    /// of consecutive throttles, then re-checks. A successful admission
    /// resets the consecutive-throttle counter. A disabled limiter never
    /// suspends.
    pub async fn acquire(&self) {
        loop {
            let delay_ms = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                if !state.config.enabled {
                    state.record(now);
                    return;
                }
                state.prune(now);
                if (state.timestamps.len() as u32) < state.config.max_requests_per_minute {
                    state.consecutive_throttles = 0;
                    state.record(now);
                    return;
                }
                state.consecutive_throttles += 1;
                state.throttled_requests += 1;
                let delay_ms = backoff_delay(&state.config, state.consecutive_throttles);
                state.total_wait_ms += delay_ms;
                delay_ms
            };
            log::debug!("rate limit reached, backing off {} ms", delay_ms);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    /// Append a timestamp and bump the total counter without any admission
    /// check. Timestamps are taken under the state lock, so they are
    /// monotonic even under concurrent callers.
    pub fn record_request(&self) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.record(now);
    }

    /// Clear the window and every counter.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.timestamps.clear();
        state.total_requests = 0;
        state.throttled_requests = 0;
        state.total_wait_ms = 0;
        state.consecutive_throttles = 0;
    }

    pub fn stats(&self) -> RateLimitStats {
        let mut state = self.state.lock().unwrap();
        state.prune(Instant::now());
        let window_count = state.timestamps.len();
        let remaining = state
            .config
            .max_requests_per_minute
            .saturating_sub(window_count as u32);
        let average_wait_ms = if state.throttled_requests > 0 {
            state.total_wait_ms as f64 / state.throttled_requests as f64
        } else {
            0.0
        };
        RateLimitStats {
            total_requests: state.total_requests,
            throttled_requests: state.throttled_requests,
            window_count,
            remaining,
            average_wait_ms,
            consecutive_throttles: state.consecutive_throttles,
            total_wait_ms: state.total_wait_ms,
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.state.lock().unwrap().config.clone()
    }

    /// Swap in a new configuration after validating it. Counters and the
    /// current window are left untouched.
    pub fn update_config(&self, config: RateLimitConfig) -> Result<(), RateLimitError> {
        config.validate()?;
        self.state.lock().unwrap().config = config;
        Ok(())
    }
}

/// Back-off delay for the `n`-th consecutive throttle (1-based).
fn backoff_delay(config: &RateLimitConfig, n: u32) -> u64 {
    let exponent = n.clamp(1, MAX_BACKOFF_EXPONENT) - 1;
    config
        .base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(config.max_delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: u32, base: u64, cap: u64) -> RateLimitConfig {
        RateLimitConfig::new(max, 60, base, cap, true).unwrap()
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let cfg = config(2, 500, 2000);
        let delays: Vec<u64> = (1..=6).map(|n| backoff_delay(&cfg, n)).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 2000, 2000, 2000]);
    }

    #[test]
    fn backoff_exponent_is_clamped() {
        let cfg = config(2, 500, u64::MAX);
        // Far beyond the clamp; must not overflow.
        assert_eq!(backoff_delay(&cfg, 500), 500 << (MAX_BACKOFF_EXPONENT - 1));
    }

    #[test]
    fn try_acquire_admits_up_to_limit() {
        let limiter = RateLimiter::new(config(3, 100, 1000));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.window_count, 3);
        assert_eq!(stats.remaining, 0);
    }

    #[test]
    fn disabled_limiter_always_admits() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, 60, 100, 1000, false).unwrap());
        for _ in 0..10 {
            assert!(limiter.try_acquire());
        }
        assert_eq!(limiter.stats().total_requests, 10);
    }

    #[test]
    fn reset_clears_window_and_counters() {
        let limiter = RateLimiter::new(config(1, 100, 1000));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        limiter.reset();
        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.window_count, 0);
        assert!(limiter.try_acquire());
    }

    #[test]
    fn update_config_rejects_invalid_values() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let bad = RateLimitConfig {
            max_requests_per_minute: 0,
            ..RateLimitConfig::default()
        };
        assert!(limiter.update_config(bad).is_err());
        // Original config still in place.
        assert_eq!(limiter.config().max_requests_per_minute, 60);
    }

    #[tokio::test]
    async fn acquire_on_disabled_limiter_never_suspends() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, 60, 100, 1000, false).unwrap());
        let before = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(before.elapsed() < Duration::from_millis(50));
        assert_eq!(limiter.stats().throttled_requests, 0);
    }
}
