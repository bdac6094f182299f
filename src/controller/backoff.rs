//! Fibonacci backoff for reconciliation errors.

/// Fibonacci sequence of minutes clamped between a minimum and maximum.
/// Each call to [`FibonacciBackoff::next_backoff_seconds`] advances the
/// sequence.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    previous: u64,
    current: u64,
    max_minutes: u64,
}

impl FibonacciBackoff {
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        Self {
            previous: 0,
            current: min_minutes.max(1),
            max_minutes,
        }
    }

    /// Returns the next delay in seconds and advances the sequence.
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let minutes = self.current.min(self.max_minutes);
        let next = (self.previous + self.current).min(self.max_minutes);
        self.previous = self.current;
        self.current = next;
        minutes * 60
    }
}

/// Backoff bookkeeping for one resource.
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u64,
}

impl BackoffState {
    pub fn new() -> Self {
        Self {
            // 1 minute minimum, 10 minutes maximum.
            backoff: FibonacciBackoff::new(1, 10),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fibonacci_progression_in_minutes() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_backoff_seconds() / 60).collect();
        assert_eq!(delays, [1, 1, 2, 3, 5, 8, 10, 10]);
    }

    #[test]
    fn minimum_is_at_least_one_minute() {
        let mut backoff = FibonacciBackoff::new(0, 10);
        assert_eq!(backoff.next_backoff_seconds(), 60);
    }

    #[test]
    fn capped_at_max() {
        let mut backoff = FibonacciBackoff::new(5, 6);
        assert_eq!(backoff.next_backoff_seconds(), 300);
        assert_eq!(backoff.next_backoff_seconds(), 300);
        assert_eq!(backoff.next_backoff_seconds(), 360);
        assert_eq!(backoff.next_backoff_seconds(), 360);
    }
}
