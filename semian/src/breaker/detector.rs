// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Failure detectors: the pluggable rule deciding when a circuit trips.

use crate::config::DetectorConfig;
use crate::window::{SlidingWindow, TimestampedWindow};
use crate::Outcome;
use std::time::Duration;

/// Snapshot of a detector's view of the world, attached to state-change
/// events and the opening log record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectorMetrics {
    /// Errors currently inside the detector's window.
    pub errors: usize,
    /// All requests inside the window, where the detector tracks them.
    pub requests: usize,
    /// Windowed error rate, for detectors that compute one.
    pub error_rate: Option<f64>,
}

/// The shared contract of all failure detectors.
///
/// Timestamps are monotonic. `should_trip` may prune internal state but must
/// not record anything.
pub(crate) trait FailureDetector: Send {
    fn mark_success(&mut self, ts: Duration);
    fn mark_failed(&mut self, ts: Duration);
    fn should_trip(&mut self, ts: Duration) -> bool;
    fn reset(&mut self);
    fn metrics(&self) -> DetectorMetrics;
}

pub(crate) fn build(config: &DetectorConfig) -> Box<dyn FailureDetector> {
    match config {
        DetectorConfig::Consecutive {
            error_threshold,
            threshold_timeout,
            timeout_enabled,
            lumping,
        } => Box::new(ConsecutiveErrors {
            threshold: *error_threshold as usize,
            threshold_timeout: *threshold_timeout,
            timeout_enabled: *timeout_enabled,
            lumping: *lumping,
            window: SlidingWindow::new(*error_threshold as usize),
        }),
        DetectorConfig::Rate {
            percent,
            time_window,
            min_volume,
            lumping,
        } => Box::new(ErrorRate {
            percent: *percent,
            time_window: *time_window,
            min_volume: *min_volume as usize,
            lumping: *lumping,
            window: TimestampedWindow::new(*time_window),
        }),
    }
}

/// Trips after `threshold` errors, optionally required to fall inside a time
/// window, with burst dedupe via the lumping interval.
struct ConsecutiveErrors {
    threshold: usize,
    threshold_timeout: Option<Duration>,
    timeout_enabled: bool,
    lumping: Option<Duration>,
    window: SlidingWindow,
}

impl FailureDetector for ConsecutiveErrors {
    fn mark_success(&mut self, _ts: Duration) {}

    fn mark_failed(&mut self, ts: Duration) {
        if let (Some(lumping), Some(last)) = (self.lumping, self.window.newest()) {
            if ts.saturating_sub(last) < lumping {
                return;
            }
        }
        if self.timeout_enabled {
            if let (Some(window), Some(newest)) = (self.threshold_timeout, self.window.newest()) {
                if ts.saturating_sub(newest) > window {
                    self.window.clear();
                }
            }
        }
        self.window.push(ts);
    }

    fn should_trip(&mut self, ts: Duration) -> bool {
        if self.window.len() < self.threshold {
            return false;
        }
        if !self.timeout_enabled {
            return true;
        }
        match (self.threshold_timeout, self.window.oldest()) {
            (Some(window), Some(oldest)) => ts.saturating_sub(oldest) <= window,
            _ => true,
        }
    }

    fn reset(&mut self) {
        self.window.clear();
    }

    fn metrics(&self) -> DetectorMetrics {
        DetectorMetrics {
            errors: self.window.len(),
            requests: self.window.len(),
            error_rate: None,
        }
    }
}

/// Trips when the windowed error rate crosses a threshold, once the window
/// carries enough requests to be meaningful.
struct ErrorRate {
    percent: f64,
    time_window: Duration,
    min_volume: usize,
    lumping: Option<Duration>,
    window: TimestampedWindow,
}

impl ErrorRate {
    fn rate(&self) -> Option<(usize, usize, f64)> {
        let errors = self.window.count(Outcome::Error);
        let total = errors + self.window.count(Outcome::Success);
        if total == 0 {
            return None;
        }
        Some((errors, total, errors as f64 / total as f64))
    }
}

impl FailureDetector for ErrorRate {
    fn mark_success(&mut self, ts: Duration) {
        self.window.add(ts, Outcome::Success);
    }

    fn mark_failed(&mut self, ts: Duration) {
        if let (Some(lumping), Some(last)) = (self.lumping, self.window.newest_of(Outcome::Error))
        {
            if ts.saturating_sub(last) < lumping {
                return;
            }
        }
        self.window.add(ts, Outcome::Error);
    }

    fn should_trip(&mut self, ts: Duration) -> bool {
        self.window
            .evict_older_than(ts.saturating_sub(self.time_window));
        match self.rate() {
            Some((_, total, rate)) => total >= self.min_volume && rate >= self.percent,
            None => false,
        }
    }

    fn reset(&mut self) {
        self.window.clear();
    }

    fn metrics(&self) -> DetectorMetrics {
        match self.rate() {
            Some((errors, total, rate)) => DetectorMetrics {
                errors,
                requests: total,
                error_rate: Some(rate),
            },
            None => DetectorMetrics::default(),
        }
    }
}
