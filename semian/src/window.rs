// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sliding-window primitives for the failure detectors.
//!
//! Per-process only: the non-adaptive detectors intentionally keep one
//! window per worker, so there is no shared-memory variant here.

use crate::Outcome;
use std::collections::VecDeque;
use std::time::Duration;

/// Fixed-capacity FIFO of timestamps; pushing past capacity drops the
/// oldest entry.
#[derive(Debug)]
pub(crate) struct SlidingWindow {
    max_size: usize,
    entries: VecDeque<Duration>,
}

impl SlidingWindow {
    pub(crate) fn new(max_size: usize) -> Self {
        SlidingWindow {
            max_size,
            entries: VecDeque::with_capacity(max_size),
        }
    }

    pub(crate) fn push(&mut self, ts: Duration) {
        if self.entries.len() == self.max_size {
            self.entries.pop_front();
        }
        self.entries.push_back(ts);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn oldest(&self) -> Option<Duration> {
        self.entries.front().copied()
    }

    pub(crate) fn newest(&self) -> Option<Duration> {
        self.entries.back().copied()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Time-indexed observation buffer with expiration and per-kind counts.
#[derive(Debug)]
pub(crate) struct TimestampedWindow {
    window_size: Duration,
    entries: VecDeque<(Duration, Outcome)>,
}

impl TimestampedWindow {
    pub(crate) fn new(window_size: Duration) -> Self {
        TimestampedWindow {
            window_size,
            entries: VecDeque::new(),
        }
    }

    pub(crate) fn add(&mut self, ts: Duration, outcome: Outcome) {
        self.evict_older_than(ts.saturating_sub(self.window_size));
        self.entries.push_back((ts, outcome));
    }

    pub(crate) fn evict_older_than(&mut self, cutoff: Duration) {
        while let Some(&(ts, _)) = self.entries.front() {
            if ts >= cutoff {
                break;
            }
            self.entries.pop_front();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn count(&self, outcome: Outcome) -> usize {
        self.entries.iter().filter(|(_, o)| *o == outcome).count()
    }

    pub(crate) fn newest_of(&self, outcome: Outcome) -> Option<Duration> {
        self.entries
            .iter()
            .rev()
            .find(|(_, o)| *o == outcome)
            .map(|(ts, _)| *ts)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(10)]
    fn sliding_window_caps_at_max_size(#[case] max: usize) {
        let mut window = SlidingWindow::new(max);
        for i in 0..20 {
            window.push(secs(i));
        }
        assert_eq!(window.len(), max);
        assert_eq!(window.oldest(), Some(secs(20 - max as u64)));
        assert_eq!(window.newest(), Some(secs(19)));
    }

    #[test]
    fn sliding_window_clear() {
        let mut window = SlidingWindow::new(4);
        window.push(secs(1));
        window.clear();
        assert_eq!(window.len(), 0);
        assert_eq!(window.oldest(), None);
    }

    #[test]
    fn timestamped_window_expires_old_entries() {
        let mut window = TimestampedWindow::new(secs(10));
        window.add(secs(0), Outcome::Error);
        window.add(secs(5), Outcome::Success);
        window.add(secs(9), Outcome::Error);
        assert_eq!(window.len(), 3);

        // An entry at t=16 pushes the cutoff past t=0 and t=5.
        window.add(secs(16), Outcome::Success);
        assert_eq!(window.len(), 2);
        assert_eq!(window.count(Outcome::Error), 1);
        assert_eq!(window.count(Outcome::Success), 1);
    }

    #[test]
    fn timestamped_window_counts_by_kind() {
        let mut window = TimestampedWindow::new(secs(60));
        for i in 0..6 {
            let outcome = if i % 3 == 0 {
                Outcome::Error
            } else {
                Outcome::Success
            };
            window.add(secs(i), outcome);
        }
        assert_eq!(window.count(Outcome::Error), 2);
        assert_eq!(window.count(Outcome::Success), 4);
        assert_eq!(window.newest_of(Outcome::Error), Some(secs(3)));
    }
}
