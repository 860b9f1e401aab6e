//! Global provider rate limiting.
//!
//! Requests reserve evenly spaced slots: at `n` requests per minute each
//! slot opens `60/n` seconds after the previous one. Reservation happens
//! under the lock, the sleep happens outside it, so concurrent callers queue
//! fairly and cancellation never blocks another caller.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{AiError, DEFAULT_RATE_LIMIT_RPM, Result};

pub struct RateLimiter {
    state: Mutex<State>,
}

struct State {
    interval: Duration,
    next_slot: Instant,
}

fn interval_for(rpm: u32) -> Duration {
    Duration::from_secs_f64(60.0 / f64::from(rpm.max(1)))
}

impl RateLimiter {
    #[must_use]
    pub fn new(rpm: u32) -> Self {
        let rpm = if rpm == 0 { DEFAULT_RATE_LIMIT_RPM } else { rpm };
        Self {
            state: Mutex::new(State {
                interval: interval_for(rpm),
                next_slot: Instant::now(),
            }),
        }
    }

    /// Change the requests-per-minute limit. Zero or negative restores the
    /// default.
    pub fn set_limit(&self, rpm: i64) {
        let rpm = if rpm <= 0 {
            DEFAULT_RATE_LIMIT_RPM
        } else {
            rpm.min(i64::from(u32::MAX)) as u32
        };
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.interval = interval_for(rpm);
    }

    /// Wait for the next request slot, yielding to cancellation.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let slot = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let now = Instant::now();
            let slot = state.next_slot.max(now);
            state.next_slot = slot + state.interval;
            slot
        };

        if slot <= Instant::now() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(AiError::Cancelled),
            () = tokio::time::sleep_until(slot) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slots_are_spaced_by_the_interval() {
        let limiter = RateLimiter::new(60); // one per second
        let cancel = CancellationToken::new();
        let begin = Instant::now();

        limiter.wait(&cancel).await.unwrap();
        limiter.wait(&cancel).await.unwrap();
        limiter.wait(&cancel).await.unwrap();

        assert!(Instant::now() - begin >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_limit_restores_default() {
        let limiter = RateLimiter::new(60);
        limiter.set_limit(0);

        let cancel = CancellationToken::new();
        let begin = Instant::now();
        limiter.wait(&cancel).await.unwrap();
        limiter.wait(&cancel).await.unwrap();

        let expected = Duration::from_secs_f64(60.0 / f64::from(DEFAULT_RATE_LIMIT_RPM));
        assert!(Instant::now() - begin >= expected);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let limiter = RateLimiter::new(1); // one per minute
        let cancel = CancellationToken::new();

        limiter.wait(&cancel).await.unwrap();
        cancel.cancel();
        assert!(matches!(
            limiter.wait(&cancel).await,
            Err(AiError::Cancelled)
        ));
    }
}
