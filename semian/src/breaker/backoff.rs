// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dynamic error-timeout backoff: exponential, then linear, then capped.

use std::time::Duration;

const INITIAL: Duration = Duration::from_millis(500);
const EXPONENTIAL_CEILING: Duration = Duration::from_secs(20);
const LINEAR_STEP: Duration = Duration::from_secs(1);
const MAX: Duration = Duration::from_secs(60);

/// Grows the open-circuit cooldown while probes keep failing:
/// 0.5s doubling up to 20s, then +1s up to a 60s cap. A successful close
/// resets the schedule.
#[derive(Debug, Clone)]
pub(crate) struct DynamicBackoff {
    current: Duration,
}

impl DynamicBackoff {
    pub(crate) fn new() -> Self {
        DynamicBackoff { current: INITIAL }
    }

    pub(crate) fn current(&self) -> Duration {
        self.current
    }

    /// Called when a half-open probe fails.
    pub(crate) fn advance(&mut self) {
        self.current = if self.current < EXPONENTIAL_CEILING {
            (self.current * 2).min(EXPONENTIAL_CEILING)
        } else {
            (self.current + LINEAR_STEP).min(MAX)
        };
    }

    /// Called when the circuit closes.
    pub(crate) fn reset(&mut self) {
        self.current = INITIAL;
    }
}
