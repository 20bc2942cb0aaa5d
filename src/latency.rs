//! Round-trip latency measurement (§2 `LatencyMeter`, SPEC_FULL §10.5).
//!
//! Grounded on `src/engine/rtt.cpp`'s `CLatencyMeasurement`: start the timer
//! on command dispatch, stop it on the first byte of the matching reply,
//! and keep a running sum/count rather than an exponential average — the
//! original reports a plain mean, and there's no reason to diverge.

use std::time::{Duration, Instant};

/// Accumulates round-trip samples for one control connection.
#[derive(Debug, Default)]
pub struct LatencyMeter {
    start: Option<Instant>,
    summed: Duration,
    measurements: u32,
}

impl LatencyMeter {
    /// Builds a meter with no samples yet.
    pub fn new() -> Self {
        LatencyMeter::default()
    }

    /// Starts timing a round trip. Returns `false` (and leaves the existing
    /// timer running) if a measurement is already in progress, matching
    /// `CLatencyMeasurement::Start`.
    pub fn start(&mut self) -> bool {
        if self.start.is_some() {
            return false;
        }
        self.start = Some(Instant::now());
        true
    }

    /// Stops the in-progress measurement and folds it into the running
    /// mean. Returns `false` if no measurement was in progress.
    pub fn stop(&mut self) -> bool {
        let Some(start) = self.start.take() else {
            return false;
        };
        self.summed += start.elapsed();
        self.measurements += 1;
        true
    }

    /// The mean round-trip latency observed so far, or `None` if no sample
    /// has completed yet (`GetLatency() == -1` in the original).
    pub fn mean_latency(&self) -> Option<Duration> {
        if self.measurements == 0 {
            None
        } else {
            Some(self.summed / self.measurements)
        }
    }

    /// Clears all accumulated samples and any in-progress measurement.
    pub fn reset(&mut self) {
        self.start = None;
        self.summed = Duration::ZERO;
        self.measurements = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_samples_reports_none() {
        let m = LatencyMeter::new();
        assert_eq!(m.mean_latency(), None);
    }

    #[test]
    fn stop_without_start_is_noop() {
        let mut m = LatencyMeter::new();
        assert!(!m.stop());
        assert_eq!(m.mean_latency(), None);
    }

    #[test]
    fn double_start_is_rejected() {
        let mut m = LatencyMeter::new();
        assert!(m.start());
        assert!(!m.start());
        m.stop();
    }

    #[test]
    fn mean_reflects_accumulated_samples() {
        let mut m = LatencyMeter::new();
        m.start();
        std::thread::sleep(Duration::from_millis(5));
        m.stop();
        m.start();
        std::thread::sleep(Duration::from_millis(5));
        m.stop();
        assert_eq!(m.measurements, 2);
        assert!(m.mean_latency().unwrap() >= Duration::from_millis(4));
    }

    #[test]
    fn reset_clears_state() {
        let mut m = LatencyMeter::new();
        m.start();
        m.stop();
        m.reset();
        assert_eq!(m.mean_latency(), None);
    }
}
