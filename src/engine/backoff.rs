//! # Exponential Backoff
//!
//! Bounded exponential backoff for retrying transient control-plane failures
//! such as throttling or IAM propagation delays.
//!
//! The delay doubles after every attempt until it reaches the cap:
//! 1s, 2s, 4s, 8s, 16s, 30s (max), 30s, ...
//!
//! ## Usage
//!
//! ```rust
//! use compliance_lake::engine::backoff::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(1000, 30_000); // 1s start, 30s max
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
//! ```

use std::time::Duration;

/// Exponential backoff calculator
///
/// Each backoff is twice the previous one, capped at `max_ms`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Starting backoff value in milliseconds (for reset)
    start_ms: u64,
    /// Current backoff value in milliseconds
    current_ms: u64,
    /// Maximum backoff value in milliseconds
    max_ms: u64,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with start and maximum values in milliseconds
    ///
    /// A zero start is raised to one millisecond so the sequence still grows.
    #[must_use]
    pub fn new(start_ms: u64, max_ms: u64) -> Self {
        let start_ms = start_ms.max(1);
        Self {
            start_ms,
            current_ms: start_ms.min(max_ms.max(1)),
            max_ms: max_ms.max(1),
        }
    }

    /// Get the next backoff duration in milliseconds and advance the sequence
    pub fn next_backoff_ms(&mut self) -> u64 {
        let result_ms = self.current_ms;
        self.current_ms = self.current_ms.saturating_mul(2).min(self.max_ms);
        result_ms
    }

    /// Get the next backoff duration as a `Duration` and advance the sequence
    ///
    /// # Example
    ///
    /// ```
    /// use compliance_lake::engine::backoff::ExponentialBackoff;
    /// use std::time::Duration;
    ///
    /// let mut backoff = ExponentialBackoff::new(500, 1000);
    /// assert_eq!(backoff.next_backoff(), Duration::from_millis(500));
    /// assert_eq!(backoff.next_backoff(), Duration::from_millis(1000));
    /// assert_eq!(backoff.next_backoff(), Duration::from_millis(1000));
    /// ```
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_millis(self.next_backoff_ms())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current_ms = self.start_ms.min(self.max_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ExponentialBackoff::new(1000, 30_000);

        assert_eq!(backoff.next_backoff_ms(), 1000);
        assert_eq!(backoff.next_backoff_ms(), 2000);
        assert_eq!(backoff.next_backoff_ms(), 4000);
        assert_eq!(backoff.next_backoff_ms(), 8000);
        assert_eq!(backoff.next_backoff_ms(), 16_000);
        assert_eq!(backoff.next_backoff_ms(), 30_000);
        assert_eq!(backoff.next_backoff_ms(), 30_000);
    }

    #[test]
    fn test_exponential_backoff_reset() {
        let mut backoff = ExponentialBackoff::new(100, 10_000);
        backoff.next_backoff_ms();
        backoff.next_backoff_ms();
        backoff.reset();
        assert_eq!(backoff.next_backoff_ms(), 100);
    }

    #[test]
    fn test_exponential_backoff_start_above_max() {
        let mut backoff = ExponentialBackoff::new(5000, 1000);
        assert_eq!(backoff.next_backoff(), Duration::from_millis(1000));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(1000));
    }

    #[test]
    fn test_exponential_backoff_zero_start() {
        let mut backoff = ExponentialBackoff::new(0, 4);
        assert_eq!(backoff.next_backoff_ms(), 1);
        assert_eq!(backoff.next_backoff_ms(), 2);
        assert_eq!(backoff.next_backoff_ms(), 4);
    }
}
