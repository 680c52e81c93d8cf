//! Reconnect/retry policy shared by the monitor and the sink.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Capped linear backoff.
///
/// The wait before attempt `n` (0-based) is `min(n, cap_steps) * unit`, so the
/// first reconnect is immediate and later ones back off one unit at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Duration of one backoff step, in milliseconds.
    pub unit_ms: u64,
    /// Maximum number of steps to wait between attempts.
    pub cap_steps: u32,
    /// Give up after this many attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            unit_ms: 1_000,
            cap_steps: 30,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn unit(&self) -> Duration {
        Duration::from_millis(self.unit_ms)
    }

    /// Wait before the 0-based `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let steps = attempt.min(self.cap_steps);
        self.unit().saturating_mul(steps)
    }

    /// Whether a 0-based `attempt` may still run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}
