//! Rolling statistics over the live sample stream.
//!
//! The [`StatsAccumulator`] consumes [`Sample`]s from an event subscription
//! and keeps a trailing window of them. It can be queried for the current
//! per-channel mean and peak plus the observed sample rate using
//! [`StatsAccumulator::summarize`].

use crate::frame::Sample;

use std::collections::VecDeque;
use std::time::Duration;

/// How much history the statistics cover by default.
const WINDOW: Duration = Duration::from_secs(10);

/// Mean and peak voltage of one channel over the window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelSummary {
    /// Mean voltage across the window.
    pub mean_volts: f64,
    /// Largest voltage seen in the window.
    pub peak_volts: f64,
}

/// A point-in-time view of the stream over the trailing window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamStats {
    /// Vertical channel summary.
    pub vertical: ChannelSummary,
    /// Horizontal channel summary.
    pub horizontal: ChannelSummary,
    /// Observed sample rate in samples per second.
    pub samples_per_sec: f64,
    /// How many samples the window currently holds.
    pub sample_count: usize,
}

/// Accumulates samples and answers questions about the recent past.
#[derive(Debug)]
pub struct StatsAccumulator {
    window: Duration,
    samples: VecDeque<Sample>,
}

impl Default for StatsAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAccumulator {
    /// An accumulator with the default ten second window.
    pub fn new() -> Self {
        Self::with_window(WINDOW)
    }

    /// An accumulator covering a caller-chosen window.
    pub fn with_window(window: Duration) -> Self {
        StatsAccumulator {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Add a sample and evict everything that has aged out of the window.
    pub fn record(&mut self, sample: Sample) {
        let horizon = sample.taken_at;
        self.samples.push_back(sample);
        while let Some(front) = self.samples.front() {
            if horizon.duration_since(front.taken_at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Summarize the window. An empty window summarizes to all zeroes.
    pub fn summarize(&self) -> StreamStats {
        let count = self.samples.len();
        if count == 0 {
            return StreamStats::default();
        }

        let mut vertical = ChannelSummary::default();
        let mut horizontal = ChannelSummary::default();
        for sample in &self.samples {
            vertical.mean_volts += sample.vertical_volts;
            horizontal.mean_volts += sample.horizontal_volts;
            vertical.peak_volts = vertical.peak_volts.max(sample.vertical_volts);
            horizontal.peak_volts = horizontal.peak_volts.max(sample.horizontal_volts);
        }
        vertical.mean_volts /= count as f64;
        horizontal.mean_volts /= count as f64;

        let samples_per_sec = if count >= 2 {
            let span = self
                .samples
                .back()
                .and_then(|newest| {
                    self.samples
                        .front()
                        .map(|oldest| newest.taken_at.duration_since(oldest.taken_at))
                })
                .unwrap_or_default()
                .as_secs_f64();
            if span > 0.0 {
                (count - 1) as f64 / span
            } else {
                0.0
            }
        } else {
            0.0
        };

        StreamStats {
            vertical,
            horizontal,
            samples_per_sec,
            sample_count: count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Instant, SystemTime};

    fn sample_at(base: Instant, offset_ms: u64, vertical: f64, horizontal: f64) -> Sample {
        Sample {
            taken_at: base + Duration::from_millis(offset_ms),
            wall_clock: SystemTime::now(),
            vertical_volts: vertical,
            horizontal_volts: horizontal,
        }
    }

    #[test]
    fn empty_window_is_all_zeroes() {
        let stats = StatsAccumulator::new();
        assert_eq!(stats.summarize(), StreamStats::default());
    }

    #[test]
    fn computes_mean_and_peak_per_channel() {
        let base = Instant::now();
        let mut stats = StatsAccumulator::new();
        stats.record(sample_at(base, 0, 1.0, 4.0));
        stats.record(sample_at(base, 10, 3.0, 2.0));

        let summary = stats.summarize();
        assert!((summary.vertical.mean_volts - 2.0).abs() < 1e-12);
        assert!((summary.vertical.peak_volts - 3.0).abs() < 1e-12);
        assert!((summary.horizontal.mean_volts - 3.0).abs() < 1e-12);
        assert!((summary.horizontal.peak_volts - 4.0).abs() < 1e-12);
        assert_eq!(summary.sample_count, 2);
    }

    #[test]
    fn old_samples_age_out() {
        let base = Instant::now();
        let mut stats = StatsAccumulator::with_window(Duration::from_secs(1));
        stats.record(sample_at(base, 0, 5.0, 5.0));
        stats.record(sample_at(base, 500, 1.0, 1.0));
        stats.record(sample_at(base, 1400, 1.0, 1.0));

        let summary = stats.summarize();
        assert_eq!(summary.sample_count, 2);
        assert!((summary.vertical.peak_volts - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rate_reflects_sample_spacing() {
        let base = Instant::now();
        let mut stats = StatsAccumulator::new();
        // 11 samples, 100 ms apart: ten intervals over one second.
        for i in 0..11 {
            stats.record(sample_at(base, i * 100, 2.5, 2.5));
        }

        let summary = stats.summarize();
        assert!((summary.samples_per_sec - 10.0).abs() < 0.01);
    }
}
