use core::fmt;
use std::time::Duration;

/// The time it took to localize one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSample {
    pub frame_index: usize,
    pub duration_millis: f64,
}

impl TimingSample {
    pub fn new(frame_index: usize, duration: Duration) -> Self {
        Self {
            frame_index,
            duration_millis: duration.as_secs_f64() * 1000.0,
        }
    }
}

/// Streaming latency statistics.
///
/// Samples are folded into a running count, sum, minimum and maximum and then dropped,
/// so the accumulator uses constant memory regardless of the sequence length.
/// An empty accumulator has no mean, minimum or maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingAccumulator {
    count: usize,
    sum: f64,
    extremes: Option<(f64, f64)>,
}

impl TimingAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one sample into the statistics.
    ///
    /// Negative and non-finite durations can not come from a monotonic clock and are folded as zero.
    pub fn fold(&mut self, sample: TimingSample) {
        let millis = sample.duration_millis;
        debug_assert!(
            millis.is_finite() && millis >= 0.0,
            "frame {} has an invalid duration of {} ms",
            sample.frame_index,
            millis
        );
        let millis = if millis.is_finite() && millis >= 0.0 {
            millis
        } else {
            0.0
        };
        self.count += 1;
        self.sum += millis;
        self.extremes = Some(match self.extremes {
            Some((min, max)) => (min.min(millis), max.max(millis)),
            None => (millis, millis),
        });
    }

    pub fn fold_duration(&mut self, frame_index: usize, duration: Duration) {
        self.fold(TimingSample::new(frame_index, duration));
    }

    /// Combines the statistics of two accumulators as if every sample had been folded into one.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        let extremes = match (self.extremes, other.extremes) {
            (Some((a_min, a_max)), Some((b_min, b_max))) => Some((a_min.min(b_min), a_max.max(b_max))),
            (a, b) => a.or(b),
        };
        Self {
            count: self.count + other.count,
            sum: self.sum + other.sum,
            extremes,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// The total time in milliseconds, `0.0` when empty.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// The mean time in milliseconds.
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }

    pub fn min(&self) -> Option<f64> {
        self.extremes.map(|(min, _)| min)
    }

    pub fn max(&self) -> Option<f64> {
        self.extremes.map(|(_, max)| max)
    }
}

impl fmt::Display for TimingAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.mean(), self.min(), self.max()) {
            (Some(mean), Some(min), Some(max)) => write!(
                f,
                "{} frames in {:.3} s (mean {:.1} ms, min {:.1} ms, max {:.1} ms)",
                self.count,
                self.sum / 1000.0,
                mean,
                min,
                max
            ),
            _ => write!(f, "no data"),
        }
    }
}
