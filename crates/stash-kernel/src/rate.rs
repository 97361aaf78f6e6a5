use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    /// KeyCDN allows 20 purge calls per minute.
    fn default() -> Self {
        Self {
            requests_per_window: 20,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn per_minute(requests: u32) -> Self {
        Self {
            requests_per_window: requests,
            ..Self::default()
        }
    }

    /// Even spacing that keeps a steady caller under the ceiling.
    pub fn spacing(&self) -> Duration {
        self.window / self.requests_per_window.max(1)
    }
}

/// Rolling-window limiter for outbound calls. Calls are spaced at least
/// `window / requests_per_window` apart, and no window ever holds more than
/// `requests_per_window` of them.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    issued: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            issued: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Time left before another call may be issued.
    pub fn delay_at(&self, now: Instant) -> Duration {
        let Some(last) = self.issued.back() else {
            return Duration::ZERO;
        };

        let spacing_ready = *last + self.config.spacing();
        let mut ready = spacing_ready;
        if self.issued.len() >= self.config.requests_per_window.max(1) as usize {
            if let Some(oldest) = self.issued.front() {
                ready = ready.max(*oldest + self.config.window);
            }
        }
        ready.saturating_duration_since(now)
    }

    /// Records a call issued at `now`.
    pub fn record(&mut self, now: Instant) {
        let window = self.config.window;
        while let Some(front) = self.issued.front() {
            if now.saturating_duration_since(*front) >= window {
                self.issued.pop_front();
            } else {
                break;
            }
        }
        self.issued.push_back(now);
    }

    /// Sleeps until a call is allowed, then records it.
    pub async fn acquire(&mut self) {
        let delay = self.delay_at(Instant::now());
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "waiting for purge rate budget");
            tokio::time::sleep(delay).await;
        }
        self.record(Instant::now());
    }
}
