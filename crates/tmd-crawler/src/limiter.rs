use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide backoff window opened by rate limit signals.
///
/// There is a single deadline: triggering again while the window is open
/// moves the deadline to `now + duration`, it does not add up.
#[derive(Debug)]
pub struct Backoff {
    duration: Duration,
    until: Mutex<Option<Instant>>,
}

impl Backoff {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            until: Mutex::new(None),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Opens (or extends) the window and returns its new deadline.
    pub fn trigger(&self) -> Instant {
        let deadline = Instant::now() + self.duration;
        let mut until = lock(&self.until);
        let deadline = match *until {
            Some(current) if current > deadline => current,
            _ => deadline,
        };
        *until = Some(deadline);
        deadline
    }

    /// The deadline, if it is still in the future.
    pub fn deadline(&self) -> Option<Instant> {
        let until = *lock(&self.until);
        until.filter(|d| *d > Instant::now())
    }

    pub fn is_active(&self) -> bool {
        self.deadline().is_some()
    }

    /// Sleeps until the window closes, following any extension made while
    /// sleeping. Returns whether it had to wait at all.
    pub async fn wait(&self) -> bool {
        let mut waited = false;
        while let Some(deadline) = self.deadline() {
            sleep_until(deadline).await;
            waited = true;
        }
        waited
    }
}

/// Minimum spacing between the starts of consecutive actions.
///
/// Each call reserves the next start slot under the lock and then sleeps
/// outside of it, so concurrent callers sharing one `Stagger` are spaced
/// too.
#[derive(Debug)]
pub struct Stagger {
    interval: Duration,
    next: Mutex<Option<Instant>>,
}

impl Stagger {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let start = {
            let mut next = lock(&self.next);
            let now = Instant::now();
            let start = match *next {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next = Some(start + self.interval);
            start
        };
        if start > Instant::now() {
            sleep_until(start).await;
        }
    }
}

/// Exponential retry delay: `base * 2^(attempt - 1)`, capped at `max`.
pub fn retry_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}
