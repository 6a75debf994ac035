use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;

/// Exponential backoff parameters: base delay, growth factor, cap, jitter.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub factor: f64,
    pub cap_ms: u64,
    pub jitter_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 200,
            factor: 2.0,
            cap_ms: 30_000,
            jitter_ms: 100,
        }
    }
}

/// Backoff state for one sequence of attempts.
///
/// `next_delay` grows the delay exponentially up to the cap; `reset`
/// returns to the base after a successful attempt.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.policy.base_ms as f64 * self.policy.factor.powi(self.attempt as i32);
        self.attempt = self.attempt.saturating_add(1);
        let capped = (exp as u64).min(self.policy.cap_ms);
        Duration::from_millis(capped.saturating_add(self.jitter()))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    // Subsecond clock noise spreads concurrent reconnect attempts apart.
    fn jitter(&self) -> u64 {
        if self.policy.jitter_ms == 0 {
            return 0;
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        u64::from(nanos) % self.policy.jitter_ms
    }
}
