//! Bounded polling with an injectable clock.
//!
//! Every "wait until the device shows up" loop in the harness goes through
//! [`poll_until`], so deadline semantics are identical for USB enumeration,
//! volume mounting and serial banners. Tests substitute a manual clock so
//! timeouts can be exercised without sleeping.

use crate::error::{Error, Result};
use log::trace;
use std::time::{Duration, Instant};

/// Source of time for polling loops and settle delays.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Block the current thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Repeatedly evaluate `attempt` until it yields a value or `timeout` elapses.
///
/// The closure runs at least once. `Ok(None)` means "not ready yet" and is
/// retried after `interval`; `Err` aborts the loop immediately. The final
/// sleep is clamped so the loop never overshoots the deadline by more than a
/// single attempt. A timeout too large to represent as an instant never
/// expires.
pub fn poll_until<T, F>(
    clock: &dyn Clock,
    interval: Duration,
    timeout: Duration,
    what: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let deadline = clock.now().checked_add(timeout);
    let mut round = 0u32;

    loop {
        round = round.saturating_add(1);
        trace!("Polling for {what} (attempt {round})");
        if let Some(value) = attempt()? {
            return Ok(value);
        }

        let Some(deadline) = deadline else {
            clock.sleep(interval);
            continue;
        };
        let now = clock.now();
        if now >= deadline {
            return Err(Error::Timeout(format!(
                "{what} not ready within {:.1}s",
                timeout.as_secs_f64()
            )));
        }
        clock.sleep(interval.min(deadline - now));
    }
}
