use std::fmt::Display;
use std::thread;
use std::time::Duration;

use relup_core::RetryConfig;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            initial_backoff: Duration::from_secs(config.initial_backoff_secs),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
        }
    }

    /// Delay after the `attempt`-th failure (1-based), doubling each time.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Runs `operation` up to `policy.attempts` times, calling `heal` before every
/// attempt to clear transient blockers. The last error is returned once the
/// attempts are exhausted.
pub fn retry_with_healing<T, E, H, F>(
    policy: &RetryPolicy,
    label: &str,
    mut heal: H,
    mut operation: F,
) -> Result<T, E>
where
    E: Display,
    H: FnMut(),
    F: FnMut() -> Result<T, E>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        heal();
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                let delay = policy.backoff_for(attempt);
                warn!(
                    target: "relup::stage",
                    operation = label,
                    attempt,
                    attempts,
                    delay_secs = delay.as_secs(),
                    error = %err,
                    "attempt failed; retrying"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
