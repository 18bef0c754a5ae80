//! Per-session lifecycle policies.

use std::time::Duration;

/// Bounded exponential backoff for opening the upstream channel after a
/// transient failure. Disabled by default: faults are surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt. Zero disables retrying.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }

    /// Whether another retry is allowed after `retries_so_far` retries.
    pub fn should_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }

    /// Delay before retry number `retry` (1-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if delay.is_finite() && delay < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(delay)
        } else {
            self.max_delay
        }
    }
}

/// How a supervisor runs its sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPolicy {
    pub retry: RetryPolicy,
    /// Close sessions without client traffic for this long. Off by default.
    pub idle_timeout: Option<Duration>,
    /// Upper bound on flushing queued envelopes during teardown.
    pub flush_timeout: Duration,
    /// Reject connections beyond this many live sessions.
    pub max_sessions: Option<usize>,
    /// Depth of the per-session outbound queue.
    pub outbound_buffer: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            idle_timeout: None,
            flush_timeout: Duration::from_secs(2),
            max_sessions: None,
            outbound_buffer: 1024,
        }
    }
}
