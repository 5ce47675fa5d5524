use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::clock::Clock;
use crate::config::RateLimitConfig;

/// Per-provider concurrency cap plus minimum spacing between call starts.
/// Saturated callers block until a slot frees up; they never fail.
pub struct RateLimiter {
    max_concurrent: usize,
    min_interval: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct LimiterState {
    in_flight: usize,
    next_start: Option<Instant>,
}

impl RateLimiter {
    pub fn new(max_concurrent: usize, min_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            min_interval,
            clock,
            state: Mutex::new(LimiterState::default()),
            released: Condvar::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config.max_concurrent, config.min_interval(), clock)
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn acquire(&self) -> RatePermit<'_> {
        let mut state = self.lock();
        while state.in_flight >= self.max_concurrent {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.in_flight += 1;

        let now = self.clock.now();
        let start = match state.next_start {
            Some(reserved) if reserved > now => reserved,
            _ => now,
        };
        state.next_start = Some(start + self.min_interval);
        drop(state);

        let wait = start.saturating_duration_since(now);
        self.clock.sleep(wait);
        RatePermit { limiter: self }
    }

    fn release(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.released.notify_one();
    }
}

/// Slot held for the duration of one provider call.
pub struct RatePermit<'a> {
    limiter: &'a RateLimiter,
}

impl Drop for RatePermit<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::clock::{ManualClock, SystemClock};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn spaces_call_starts() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(4, Duration::from_millis(500), clock.clone());

        drop(limiter.acquire());
        drop(limiter.acquire());
        drop(limiter.acquire());

        assert_eq!(
            clock.sleeps(),
            [Duration::from_millis(500), Duration::from_millis(500)]
        );
    }

    #[test]
    fn caps_concurrency_and_queues_callers() {
        let limiter = Arc::new(RateLimiter::new(
            2,
            Duration::ZERO,
            Arc::new(SystemClock),
        ));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let _permit = limiter.acquire();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(limiter.in_flight(), 0);
    }
}
