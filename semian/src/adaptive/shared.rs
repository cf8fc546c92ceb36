// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-layout controller state, one struct per resource.
//!
//! The struct lives at offset 0 of a zero-initialized shared segment and is
//! valid in that state: counters at zero, rates at 0.0, and an init word
//! that gates one-time seeding. Every field is an atomic; the hot path
//! (outcome counters, rejection rate) is lock-free, while the PID registers
//! and estimator state are only touched by the worker holding the tick
//! semaphore.

use crate::adaptive::p2::P2Quantile;
use crate::Outcome;
use semian_ipc::atomics::AtomicF64;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Ring capacity for recent windowed error rates.
pub(crate) const HISTORY_CAPACITY: usize = 32;

/// Quantile tracked over historical error rates.
pub(crate) const ERROR_RATE_QUANTILE: f64 = 0.9;

/// Observations used to prefill the estimator at bootstrap.
pub(crate) const SEED_OBSERVATIONS: u64 = 1_000;

const INIT_EMPTY: u64 = 0;
const INIT_SEEDING: u64 = 1;
const INIT_READY: u64 = 2;

#[repr(C)]
pub(crate) struct AdaptiveShared {
    success: AtomicU64,
    error: AtomicU64,
    rejected: AtomicU64,
    rejection_rate: AtomicF64,
    last_update_ns: AtomicU64,
    window_seq: AtomicU32,
    _reserved: AtomicU32,
    integral: AtomicF64,
    previous_p_value: AtomicF64,
    p2_count: AtomicU64,
    p2_heights: [AtomicF64; 5],
    p2_positions: [AtomicU64; 5],
    p2_desired: [AtomicF64; 5],
    history_head: AtomicU64,
    history_len: AtomicU64,
    history: [AtomicF64; HISTORY_CAPACITY],
    init_state: AtomicU64,
}

pub(crate) const SHARED_SIZE: usize = std::mem::size_of::<AdaptiveShared>();
static_assertions::const_assert_eq!(SHARED_SIZE, 472);
static_assertions::const_assert_eq!(std::mem::align_of::<AdaptiveShared>(), 8);

/// Snapshot of one closed counting window.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WindowCounts {
    pub successes: u64,
    pub errors: u64,
    pub rejected: u64,
}

impl WindowCounts {
    pub(crate) fn total(&self) -> u64 {
        self.successes + self.errors + self.rejected
    }

    pub(crate) fn error_rate(&self) -> f64 {
        self.errors as f64 / self.total().max(1) as f64
    }
}

impl AdaptiveShared {
    /// One-time seeding of a fresh segment; racing workers elect one seeder
    /// and the rest wait for `INIT_READY`.
    ///
    /// Seeding is deterministic, so a worker that times out waiting (the
    /// elected seeder died mid-way) repeats it; the repeat writes the same
    /// values.
    pub(crate) fn ensure_initialized(&self, initial_error_rate: f64, now_ns: u64) {
        match self.init_state.compare_exchange(
            INIT_EMPTY,
            INIT_SEEDING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => self.seed(initial_error_rate, now_ns),
            Err(INIT_READY) => {}
            Err(_) => {
                let deadline = Instant::now() + Duration::from_secs(2);
                while self.init_state.load(Ordering::Acquire) != INIT_READY {
                    if Instant::now() >= deadline {
                        self.seed(initial_error_rate, now_ns);
                        break;
                    }
                    std::hint::spin_loop();
                    std::thread::yield_now();
                }
            }
        }
    }

    fn seed(&self, initial_error_rate: f64, now_ns: u64) {
        let estimator = P2Quantile::seeded(
            ERROR_RATE_QUANTILE,
            initial_error_rate,
            SEED_OBSERVATIONS,
        );
        self.store_estimator(&estimator);
        self.last_update_ns.store(now_ns, Ordering::Release);
        self.init_state.store(INIT_READY, Ordering::Release);
    }

    pub(crate) fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Success => &self.success,
            Outcome::Error => &self.error,
            Outcome::Rejected => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejection_rate(&self) -> f64 {
        self.rejection_rate.load(Ordering::Acquire)
    }

    pub(crate) fn set_rejection_rate(&self, rate: f64) {
        self.rejection_rate.store(rate, Ordering::Release);
    }

    pub(crate) fn last_update_ns(&self) -> u64 {
        self.last_update_ns.load(Ordering::Acquire)
    }

    pub(crate) fn window_seq(&self) -> u32 {
        self.window_seq.load(Ordering::Acquire)
    }

    /// Closes the current counting window and opens the next one.
    pub(crate) fn take_window(&self, now_ns: u64) -> WindowCounts {
        let counts = WindowCounts {
            successes: self.success.swap(0, Ordering::AcqRel),
            errors: self.error.swap(0, Ordering::AcqRel),
            rejected: self.rejected.swap(0, Ordering::AcqRel),
        };
        self.window_seq.fetch_add(1, Ordering::AcqRel);
        self.last_update_ns.store(now_ns, Ordering::Release);
        counts
    }

    pub(crate) fn integral(&self) -> f64 {
        self.integral.load(Ordering::Acquire)
    }

    pub(crate) fn set_integral(&self, value: f64) {
        self.integral.store(value, Ordering::Release);
    }

    pub(crate) fn previous_p_value(&self) -> f64 {
        self.previous_p_value.load(Ordering::Acquire)
    }

    pub(crate) fn set_previous_p_value(&self, value: f64) {
        self.previous_p_value.store(value, Ordering::Release);
    }

    pub(crate) fn load_estimator(&self) -> P2Quantile {
        let mut heights = [0.0; 5];
        let mut positions = [0_i64; 5];
        let mut desired = [0.0; 5];
        for i in 0..5 {
            heights[i] = self.p2_heights[i].load(Ordering::Acquire);
            positions[i] = self.p2_positions[i].load(Ordering::Acquire) as i64;
            desired[i] = self.p2_desired[i].load(Ordering::Acquire);
        }
        P2Quantile::from_parts(
            ERROR_RATE_QUANTILE,
            self.p2_count.load(Ordering::Acquire),
            heights,
            positions,
            desired,
        )
    }

    pub(crate) fn store_estimator(&self, estimator: &P2Quantile) {
        for i in 0..5 {
            self.p2_heights[i].store(estimator.heights[i], Ordering::Release);
            self.p2_positions[i].store(estimator.positions[i] as u64, Ordering::Release);
            self.p2_desired[i].store(estimator.desired[i], Ordering::Release);
        }
        self.p2_count.store(estimator.count, Ordering::Release);
    }

    pub(crate) fn push_history(&self, error_rate: f64) {
        let head = self.history_head.load(Ordering::Acquire) as usize;
        self.history[head % HISTORY_CAPACITY].store(error_rate, Ordering::Release);
        self.history_head
            .store((head as u64 + 1) % HISTORY_CAPACITY as u64, Ordering::Release);
        let len = self.history_len.load(Ordering::Acquire);
        if len < HISTORY_CAPACITY as u64 {
            self.history_len.store(len + 1, Ordering::Release);
        }
    }

    /// Recent windowed error rates, oldest first.
    pub(crate) fn history(&self) -> Vec<f64> {
        let len = self.history_len.load(Ordering::Acquire) as usize;
        let head = self.history_head.load(Ordering::Acquire) as usize;
        let mut rates = Vec::with_capacity(len);
        for i in 0..len {
            let slot = (head + HISTORY_CAPACITY - len + i) % HISTORY_CAPACITY;
            rates.push(self.history[slot].load(Ordering::Acquire));
        }
        rates
    }

    /// Clears request counters and controller registers; the estimator and
    /// its history survive a reset.
    pub(crate) fn clear(&self) {
        self.success.store(0, Ordering::Release);
        self.error.store(0, Ordering::Release);
        self.rejected.store(0, Ordering::Release);
        self.set_rejection_rate(0.0);
        self.set_integral(0.0);
        self.set_previous_p_value(0.0);
    }
}
