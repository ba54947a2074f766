//! Exponential backoff shared by every retried operation in this crate:
//! SSH `connect`/`exec`, lock acquisition, and the outer `lock`/`unlock`
//! retry layers (spec §4.2, §4.4, §7). All four use the same constants —
//! factor 3, up to 3 attempts, no jitter — so they share one policy here.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use backoff::{ExponentialBackoffBuilder, SystemClock};

/// Multiplier applied to the backoff interval after each attempt.
pub const BACKOFF_FACTOR: f64 = 3.0;
/// Total attempts allowed, including the first (non-retried) one.
pub const MAX_RETRIES: u32 = 3;
const INITIAL_INTERVAL: Duration = Duration::from_millis(100);

/// Caps an [`ExponentialBackoff`] at [`MAX_RETRIES`] total calls to
/// `next_backoff`, since the `backoff` crate only bounds retries by
/// elapsed wall-clock time out of the box.
pub struct LimitedBackoff {
    inner: ExponentialBackoff<SystemClock>,
    attempts: u32,
}

impl Backoff for LimitedBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= MAX_RETRIES {
            return None;
        }
        self.inner.next_backoff()
    }

    fn reset(&mut self) {
        self.attempts = 0;
        self.inner.reset();
    }
}

/// A fresh backoff sequence: deterministic exponential delays, no jitter,
/// capped at [`MAX_RETRIES`] attempts.
pub fn new_backoff() -> LimitedBackoff {
    let inner = ExponentialBackoffBuilder::new()
        .with_initial_interval(INITIAL_INTERVAL)
        .with_multiplier(BACKOFF_FACTOR)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build();
    LimitedBackoff { inner, attempts: 0 }
}
