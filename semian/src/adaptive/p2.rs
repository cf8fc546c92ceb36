// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming quantile estimation (the P-squared algorithm).
//!
//! Five markers track the target quantile without storing observations:
//! heights estimate the quantile curve, integer positions count how many
//! observations sit at or below each marker, and desired positions advance
//! fractionally per observation. Markers move by one position at a time,
//! preferring the parabolic height adjustment and falling back to linear
//! interpolation when the parabola would break marker ordering.

/// P² estimator state. Plain data so the adaptive controller can round-trip
/// it through shared memory.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct P2Quantile {
    quantile: f64,
    pub(crate) count: u64,
    pub(crate) heights: [f64; 5],
    pub(crate) positions: [i64; 5],
    pub(crate) desired: [f64; 5],
}

impl P2Quantile {
    pub(crate) fn new(quantile: f64) -> Self {
        P2Quantile {
            quantile,
            count: 0,
            heights: [0.0; 5],
            positions: [0, 1, 2, 3, 4],
            desired: [0.0; 5],
        }
    }

    /// Rebuilds an estimator from persisted state.
    pub(crate) fn from_parts(
        quantile: f64,
        count: u64,
        heights: [f64; 5],
        positions: [i64; 5],
        desired: [f64; 5],
    ) -> Self {
        P2Quantile {
            quantile,
            count,
            heights,
            positions,
            desired,
        }
    }

    /// A fresh estimator prefilled with `n` observations of `value`.
    pub(crate) fn seeded(quantile: f64, value: f64, n: u64) -> Self {
        let mut estimator = Self::new(quantile);
        for _ in 0..n {
            estimator.observe(value);
        }
        estimator
    }

    pub(crate) fn observe(&mut self, x: f64) {
        if self.count < 5 {
            self.heights[self.count as usize] = x;
            self.count += 1;
            if self.count == 5 {
                self.heights.sort_by(f64::total_cmp);
                let q = self.quantile;
                self.positions = [0, 1, 2, 3, 4];
                self.desired = [0.0, 2.0 * q, 4.0 * q, 2.0 + 2.0 * q, 4.0];
            }
            return;
        }

        let cell = if x < self.heights[0] {
            self.heights[0] = x;
            0
        } else if x >= self.heights[4] {
            self.heights[4] = x;
            3
        } else {
            let mut cell = 0;
            for i in 0..4 {
                if self.heights[i] <= x && x < self.heights[i + 1] {
                    cell = i;
                    break;
                }
            }
            cell
        };

        self.count += 1;
        for position in self.positions.iter_mut().skip(cell + 1) {
            *position += 1;
        }
        let q = self.quantile;
        for (desired, increment) in self
            .desired
            .iter_mut()
            .zip([0.0, q / 2.0, q, (1.0 + q) / 2.0, 1.0])
        {
            *desired += increment;
        }

        for i in 1..4 {
            let offset = self.desired[i] - self.positions[i] as f64;
            let room_right = self.positions[i + 1] - self.positions[i] > 1;
            let room_left = self.positions[i - 1] - self.positions[i] < -1;
            if (offset >= 1.0 && room_right) || (offset <= -1.0 && room_left) {
                let step: i64 = if offset >= 0.0 { 1 } else { -1 };
                let candidate = self.parabolic(i, step);
                self.heights[i] = if self.heights[i - 1] < candidate
                    && candidate < self.heights[i + 1]
                {
                    candidate
                } else {
                    self.linear(i, step)
                };
                self.positions[i] += step;
            }
        }
    }

    /// Current estimate of the target quantile.
    pub(crate) fn query(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        if self.count < 5 {
            let mut prefix = [0.0; 5];
            let len = self.count as usize;
            prefix[..len].copy_from_slice(&self.heights[..len]);
            prefix[..len].sort_by(f64::total_cmp);
            let rank = ((self.quantile * len as f64).ceil() as usize).clamp(1, len);
            return prefix[rank - 1];
        }
        self.heights[2]
    }

    fn parabolic(&self, i: usize, step: i64) -> f64 {
        let q = &self.heights;
        let n = &self.positions;
        let d = step as f64;
        q[i] + d / ((n[i + 1] - n[i - 1]) as f64)
            * (((n[i] - n[i - 1]) as f64 + d) * (q[i + 1] - q[i]) / ((n[i + 1] - n[i]) as f64)
                + ((n[i + 1] - n[i]) as f64 - d) * (q[i] - q[i - 1]) / ((n[i] - n[i - 1]) as f64))
    }

    fn linear(&self, i: usize, step: i64) -> f64 {
        let q = &self.heights;
        let n = &self.positions;
        let j = (i as i64 + step) as usize;
        q[i] + step as f64 * (q[j] - q[i]) / ((n[j] - n[i]) as f64)
    }
}
