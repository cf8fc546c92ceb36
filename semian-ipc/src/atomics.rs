// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Atomic views over raw shared memory.
//!
//! Cross-process state lives in zero-initialized `MAP_SHARED` regions, so
//! every field must be valid at the all-zeroes bit pattern and every access
//! must go through an atomic. [`AtomicF64`] bit-casts through `AtomicU64`,
//! which keeps doubles lock-free on every 64-bit target.

use crate::shm::{MappedMem, MemoryHandle};
use crate::IpcError;
use std::sync::atomic::{AtomicU64, Ordering};

/// A double stored as its IEEE-754 bit pattern in an `AtomicU64`.
///
/// Zeroed memory reads as `0.0`, which is what a fresh region should report
/// for rates and integrals.
#[repr(transparent)]
#[derive(Debug)]
pub struct AtomicF64 {
    bits: AtomicU64,
}

static_assertions::assert_eq_size!(AtomicF64, u64);

impl AtomicF64 {
    pub const fn new(value: f64) -> Self {
        AtomicF64 {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    pub fn load(&self, order: Ordering) -> f64 {
        f64::from_bits(self.bits.load(order))
    }

    pub fn store(&self, value: f64, order: Ordering) {
        self.bits.store(value.to_bits(), order)
    }

    pub fn swap(&self, value: f64, order: Ordering) -> f64 {
        f64::from_bits(self.bits.swap(value.to_bits(), order))
    }

    /// CAS-loop addition; returns the previous value.
    pub fn fetch_add(&self, delta: f64, order: Ordering) -> f64 {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .bits
                .compare_exchange_weak(current, next, order, Ordering::Relaxed)
            {
                Ok(prev) => return f64::from_bits(prev),
                Err(observed) => current = observed,
            }
        }
    }
}

/// Word-indexed atomic access into a mapping.
///
/// The region is treated as an array of 64-bit slots; `u64` and `f64` views
/// of the same slot alias the same bits, which is exactly the exchange the
/// bit-cast [`AtomicF64`] is for.
pub struct AtomicRegion<'a> {
    words: &'a [AtomicU64],
}

impl<'a> AtomicRegion<'a> {
    pub fn new<T: MemoryHandle>(mem: &'a MappedMem<T>) -> crate::Result<Self> {
        let len = mem.len();
        if mem.as_ptr() as usize % std::mem::align_of::<AtomicU64>() != 0 {
            return Err(IpcError::Argument("mapping is not 64-bit aligned".into()));
        }
        let words = unsafe {
            std::slice::from_raw_parts(mem.as_ptr().cast::<AtomicU64>(), len / 8)
        };
        Ok(AtomicRegion { words })
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn word(&self, index: usize) -> &'a AtomicU64 {
        &self.words[index]
    }

    pub fn double(&self, index: usize) -> &'a AtomicF64 {
        let word = &self.words[index];
        // AtomicF64 is repr(transparent) over AtomicU64.
        unsafe { &*(word as *const AtomicU64).cast::<AtomicF64>() }
    }
}
