//! Rolling rate window.
//!
//! Accumulates the bytes received on one connection and turns them into a
//! kilobit-per-second sample once the window has been open for at least
//! [`WINDOW_THRESHOLD`].

use chrono::{DateTime, Local};
use std::time::Duration;
use tokio::time::Instant;

/// Minimum age of a window before it is closed into a sample
pub const WINDOW_THRESHOLD: Duration = Duration::from_millis(1000);

/// One bandwidth data point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Wall-clock time at which the window was closed
    pub timestamp: DateTime<Local>,
    /// Throughput over the window, floor(bits / elapsed_ms)
    pub kbps: u64,
}

/// Byte accumulator for the currently open interval
#[derive(Debug)]
pub struct RateWindow {
    accumulated_bytes: u64,
    window_start: Instant,
}

impl RateWindow {
    /// Open a window starting now
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Open a window starting at `start`
    pub fn starting_at(start: Instant) -> Self {
        Self {
            accumulated_bytes: 0,
            window_start: start,
        }
    }

    /// Add `n_bytes` to the current window
    pub fn record(&mut self, n_bytes: u64) {
        self.accumulated_bytes = self.accumulated_bytes.saturating_add(n_bytes);
    }

    /// Close the window into a sample if it is old enough.
    ///
    /// On emission the accumulator is reset and the next window starts at
    /// `now`. Returns `None` while the window is younger than
    /// [`WINDOW_THRESHOLD`].
    pub fn maybe_emit(&mut self, now: Instant) -> Option<Sample> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < WINDOW_THRESHOLD {
            return None;
        }

        let elapsed_ms = elapsed.as_millis();
        let bits = u128::from(self.accumulated_bytes) * 8;
        let kbps = u64::try_from(bits / elapsed_ms).unwrap_or(u64::MAX);

        self.accumulated_bytes = 0;
        self.window_start = now;

        Some(Sample {
            timestamp: Local::now(),
            kbps,
        })
    }

    pub fn accumulated_bytes(&self) -> u64 {
        self.accumulated_bytes
    }

    #[cfg(test)]
    pub fn window_start(&self) -> Instant {
        self.window_start
    }
}

impl Default for RateWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_sample_before_threshold() {
        let start = Instant::now();
        let mut window = RateWindow::starting_at(start);

        let mut total = 0u64;
        for (i, n) in [10u64, 0, 4096, 1, 65536].iter().enumerate() {
            window.record(*n);
            total += *n;
            let now = start + Duration::from_millis(200 * i as u64);
            assert!(window.maybe_emit(now).is_none());
        }

        assert!(window.maybe_emit(start + Duration::from_millis(999)).is_none());
        assert_eq!(window.accumulated_bytes(), total);
        assert_eq!(window.window_start(), start);
    }

    #[test]
    fn test_emit_at_threshold() {
        let start = Instant::now();
        let mut window = RateWindow::starting_at(start);
        window.record(1000);

        let now = start + WINDOW_THRESHOLD;
        let sample = window.maybe_emit(now).unwrap();
        assert_eq!(sample.kbps, 8);
        assert_eq!(window.accumulated_bytes(), 0);
        assert_eq!(window.window_start(), now);
    }

    #[test]
    fn test_kbps_is_floored() {
        // 125000 bytes sent within the first 500ms, checked at 1100ms
        let start = Instant::now();
        let mut window = RateWindow::starting_at(start);

        window.record(100_000);
        assert!(window.maybe_emit(start + Duration::from_millis(300)).is_none());
        window.record(25_000);
        assert!(window.maybe_emit(start + Duration::from_millis(500)).is_none());

        let sample = window.maybe_emit(start + Duration::from_millis(1100)).unwrap();
        assert_eq!(sample.kbps, 909);
        assert_eq!(window.accumulated_bytes(), 0);
    }

    #[test]
    fn test_only_one_sample_per_window() {
        let start = Instant::now();
        let mut window = RateWindow::starting_at(start);
        window.record(5000);

        let first = start + Duration::from_millis(1500);
        assert!(window.maybe_emit(first).is_some());
        // A new window opened at `first`
        window.record(5000);
        assert!(window.maybe_emit(first + Duration::from_millis(10)).is_none());
        assert_eq!(window.accumulated_bytes(), 5000);
    }

    #[test]
    fn test_empty_window_emits_zero() {
        let start = Instant::now();
        let mut window = RateWindow::starting_at(start);
        let sample = window.maybe_emit(start + Duration::from_secs(3)).unwrap();
        assert_eq!(sample.kbps, 0);
    }

    #[test]
    fn test_large_totals_do_not_overflow() {
        let start = Instant::now();
        let mut window = RateWindow::starting_at(start);
        window.record(1 << 40);
        window.record(1 << 40);

        let sample = window.maybe_emit(start + Duration::from_secs(1)).unwrap();
        assert_eq!(sample.kbps, (2u64 << 40) * 8 / 1000);
    }
}
