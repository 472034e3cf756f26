//! # Fibonacci Backoff
//!
//! Requeue delays for tenants whose reconcile keeps failing. Delays follow the
//! Fibonacci sequence in minutes and are capped: with `new(1, 10)` the
//! sequence is 1m, 1m, 2m, 3m, 5m, 8m, 10m, 10m, ...
//!
//! ```rust
//! use tenant_controller::controller::backoff::FibonacciBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = FibonacciBackoff::new(1, 10);
//! assert_eq!(backoff.next_delay(), Duration::from_secs(60));
//! assert_eq!(backoff.next_delay(), Duration::from_secs(60));
//! assert_eq!(backoff.next_delay(), Duration::from_secs(120));
//! ```

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_minutes: u64,
    max_minutes: u64,
    prev_minutes: u64,
    current_minutes: u64,
    failures: u32,
}

impl FibonacciBackoff {
    /// `min_minutes` is used for the first two delays, `max_minutes` caps the sequence
    #[must_use]
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        Self {
            min_minutes,
            max_minutes: max_minutes.max(min_minutes),
            prev_minutes: 0,
            current_minutes: min_minutes,
            failures: 0,
        }
    }

    /// Delay for the current failure; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_secs(self.current_minutes * 60);
        let next = self.prev_minutes.saturating_add(self.current_minutes);
        self.prev_minutes = self.current_minutes;
        self.current_minutes = next.min(self.max_minutes);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Consecutive failures seen since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Back to the first delay, after a successful reconcile
    pub fn reset(&mut self) {
        self.prev_minutes = 0;
        self.current_minutes = self.min_minutes;
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(backoff: &mut FibonacciBackoff, n: usize) -> Vec<u64> {
        (0..n).map(|_| backoff.next_delay().as_secs() / 60).collect()
    }

    #[test]
    fn test_sequence_is_capped() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        assert_eq!(minutes(&mut backoff, 9), vec![1, 1, 2, 3, 5, 8, 10, 10, 10]);
        assert_eq!(backoff.failures(), 9);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        minutes(&mut backoff, 4);
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(minutes(&mut backoff, 3), vec![1, 1, 2]);
    }

    #[test]
    fn test_independent_instances() {
        let mut a = FibonacciBackoff::new(1, 10);
        let mut b = FibonacciBackoff::new(1, 10);
        minutes(&mut a, 5);
        assert_eq!(minutes(&mut b, 2), vec![1, 1]);
        assert_eq!(minutes(&mut a, 1), vec![8]);
    }

    #[test]
    fn test_max_below_min_is_raised() {
        let mut backoff = FibonacciBackoff::new(3, 1);
        assert_eq!(minutes(&mut backoff, 3), vec![3, 3, 3]);
    }
}
