//! TW-013: Bounded exponential backoff for transient backend errors.

use crate::transport::CancelToken;
use std::thread;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;

const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Retry policy for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1)
    pub max_attempts: u32,
    /// The first retry waits twice this; each later one doubles
    pub base_delay_ms: u64,
    /// Cap on any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delays between attempts (`max_attempts - 1` of them).
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.base_delay_ms)
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .take(self.max_attempts.saturating_sub(1) as usize)
    }

    /// Run `op` until it succeeds, fails non-transiently, or attempts run out.
    /// Returns the last result and the number of attempts made. Sleeps stop
    /// early when `cancel` is set.
    pub fn run<T, E>(
        &self,
        cancel: &CancelToken,
        mut op: impl FnMut(u32) -> Result<T, E>,
        is_transient: impl Fn(&E) -> bool,
    ) -> (Result<T, E>, u32) {
        let mut attempt = 1;
        let mut delays = self.delays();
        loop {
            let result = op(attempt);
            let err = match result {
                Ok(v) => return (Ok(v), attempt),
                Err(e) => e,
            };
            if !is_transient(&err) || cancel.is_cancelled() {
                return (Err(err), attempt);
            }
            let Some(delay) = delays.next() else {
                return (Err(err), attempt);
            };
            tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "transient failure, retrying");
            if !sleep_unless_cancelled(delay, cancel) {
                return (Err(err), attempt);
            }
            attempt += 1;
        }
    }
}

/// Sleep in slices; false if cancelled meanwhile.
fn sleep_unless_cancelled(total: Duration, cancel: &CancelToken) -> bool {
    let mut left = total;
    while !left.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let slice = left.min(SLEEP_SLICE);
        thread::sleep(slice);
        left -= slice;
    }
    !cancel.is_cancelled()
}
