//! Time-window helpers for actions users tend to repeat quickly.
//!
//! Both work on caller-supplied timestamps (seconds), so they never read a
//! clock themselves.

use std::time::Duration;

/// Lets one action through per window; everything else inside the window
/// is dropped.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    window: f64,
    last: Option<f64>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.as_secs_f64(),
            last: None,
        }
    }

    pub fn try_acquire(&mut self, now: f64) -> bool {
        if let Some(last) = self.last {
            if now - last < self.window {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}

/// Holds back a value that keeps changing and releases only the latest one.
///
/// The first value after a quiet period is released immediately; a value
/// submitted within `window` of the previous release waits out the window,
/// and anything submitted meanwhile replaces it.
#[derive(Debug, Clone)]
pub struct Debouncer<T> {
    window: f64,
    pending: Option<(T, f64)>,
    last_fired: Option<f64>,
}

impl<T> Debouncer<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.as_secs_f64(),
            pending: None,
            last_fired: None,
        }
    }

    pub fn submit(&mut self, value: T, now: f64) {
        let due = match self.last_fired {
            Some(fired) if now - fired < self.window => now + self.window,
            _ => now,
        };
        self.pending = Some((value, due));
    }

    pub fn poll(&mut self, now: f64) -> Option<T> {
        match self.pending {
            Some((_, due)) if due <= now => {
                self.last_fired = Some(now);
                self.pending.take().map(|(value, _)| value)
            }
            _ => None,
        }
    }

    pub fn next_due(&self) -> Option<f64> {
        self.pending.as_ref().map(|(_, due)| *due)
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_window() {
        let mut limiter = RateLimiter::new(Duration::from_secs(2));
        assert!(limiter.try_acquire(10.0));
        assert!(!limiter.try_acquire(10.5));
        assert!(!limiter.try_acquire(11.9));
        assert!(limiter.try_acquire(12.0));
    }

    #[test]
    fn test_debouncer_first_value_is_immediate() {
        let mut debounce = Debouncer::new(Duration::from_secs(1));
        debounce.submit(0.3, 5.0);
        assert_eq!(debounce.poll(5.0), Some(0.3));
        assert!(!debounce.is_pending());
    }

    #[test]
    fn test_debouncer_keeps_latest_inside_window() {
        let mut debounce = Debouncer::new(Duration::from_secs(1));
        debounce.submit(1, 0.0);
        assert_eq!(debounce.poll(0.0), Some(1));

        debounce.submit(2, 0.25);
        debounce.submit(3, 0.5);
        assert_eq!(debounce.poll(1.0), None);
        assert_eq!(debounce.next_due(), Some(1.5));
        assert_eq!(debounce.poll(1.5), Some(3));
        assert_eq!(debounce.poll(3.0), None);
    }
}
