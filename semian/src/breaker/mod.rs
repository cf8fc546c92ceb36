// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The circuit-breaker state machine.
//!
//! One struct, parameterized by a [`detector::FailureDetector`]. State is
//! per process: each worker observes its own call stream, and over-rejecting
//! is safer than over-admitting, so the classic breakers deliberately do not
//! coordinate across processes. Observations are serialized by the interior
//! mutex; `work` itself runs outside it.

pub(crate) mod backoff;
pub mod detector;

use crate::config::{ClassicConfig, TimeoutPolicy};
use crate::error::{AcquireError, Error, MarksCircuits};
use crate::events::{self, Event};
use crate::time;
use backoff::DynamicBackoff;
use detector::{DetectorMetrics, FailureDetector};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

/// Externally visible breaker state.
///
/// `PartiallyOpen` is only ever reported by the adaptive breaker, whose
/// output is a rejection probability rather than a binary switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
    PartiallyOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
            CircuitState::PartiallyOpen => "partially_open",
        };
        f.write_str(label)
    }
}

/// Lets a half-open probe shorten the downstream client's own timeout, so a
/// hung dependency cannot pin the probe for a full client timeout.
/// The breaker always restores the override when the probe call finishes.
pub trait HalfOpenTimeout {
    fn set_probe_timeout(&self, timeout: Duration);
    fn clear_probe_timeout(&self);
}

pub struct CircuitBreaker {
    name: Arc<str>,
    success_threshold: u32,
    half_open_resource_timeout: Option<Duration>,
    inner: Mutex<Inner>,
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Duration>,
    error_timeout: Duration,
    backoff: Option<DynamicBackoff>,
    successes: u32,
    last_error: Option<String>,
    detector: Box<dyn FailureDetector>,
}

impl CircuitBreaker {
    pub(crate) fn new(name: Arc<str>, config: &ClassicConfig) -> Self {
        let (error_timeout, backoff) = match config.timeout {
            TimeoutPolicy::Fixed(timeout) => (timeout, None),
            TimeoutPolicy::Dynamic => {
                let backoff = DynamicBackoff::new();
                (backoff.current(), Some(backoff))
            }
        };
        CircuitBreaker {
            name,
            success_threshold: config.success_threshold,
            half_open_resource_timeout: config.half_open_resource_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                error_timeout,
                backoff,
                successes: 0,
                last_error: None,
                detector: detector::build(&config.detector),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// The current open-circuit cooldown (fixed, or wherever the dynamic
    /// backoff schedule currently sits).
    pub fn error_timeout(&self) -> Duration {
        self.lock().error_timeout
    }

    pub fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    pub fn metrics(&self) -> DetectorMetrics {
        self.lock().detector.metrics()
    }

    pub(crate) fn in_use(&self) -> bool {
        self.lock().state != CircuitState::Closed
    }

    /// Would a call be accepted right now? Never transitions.
    pub fn request_allowed(&self) -> bool {
        self.request_allowed_at(time::monotonic())
    }

    pub(crate) fn request_allowed_at(&self, now: Duration) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => inner.cooldown_elapsed(now),
            CircuitState::PartiallyOpen => true,
        }
    }

    /// Runs `work` under the breaker.
    ///
    /// Rejects immediately while open and inside the cooldown; otherwise
    /// runs `work`, records the outcome (unless the error opts out via
    /// [`MarksCircuits`]) and re-raises caller errors untouched.
    pub fn acquire<T, E, F>(
        &self,
        probe_override: Option<&dyn HalfOpenTimeout>,
        work: F,
    ) -> Result<T, AcquireError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: MarksCircuits + std::error::Error + 'static,
    {
        let state = self.check_entry(time::monotonic())?;

        struct RestoreTimeout<'a>(&'a dyn HalfOpenTimeout);
        impl Drop for RestoreTimeout<'_> {
            fn drop(&mut self) {
                self.0.clear_probe_timeout();
            }
        }
        let _restore = match (state, probe_override, self.half_open_resource_timeout) {
            (CircuitState::HalfOpen, Some(overridable), Some(timeout)) => {
                overridable.set_probe_timeout(timeout);
                Some(RestoreTimeout(overridable))
            }
            _ => None,
        };

        let result = work();
        match &result {
            Ok(_) => self.record_success_at(time::monotonic()),
            Err(err) if err.marks_circuits() => {
                self.record_failure_at(err.to_string(), time::monotonic())
            }
            Err(_) => {}
        }
        result.map_err(AcquireError::Work)
    }

    /// Forces the breaker closed and clears the error window.
    pub fn reset(&self) {
        let event = {
            let mut inner = self.lock();
            inner.last_error = None;
            inner.close();
            Some(self.state_change(&inner))
        };
        publish_all(event);
    }

    /// Admission decision; transitions open -> half-open when the cooldown
    /// has elapsed. Returns the state the call runs under.
    pub(crate) fn check_entry(&self, now: Duration) -> Result<CircuitState, Error> {
        let (state, event) = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Open if !inner.cooldown_elapsed(now) => {
                    return Err(Error::OpenCircuit {
                        name: self.name.to_string(),
                    })
                }
                CircuitState::Open => {
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    (CircuitState::HalfOpen, Some(self.state_change(&inner)))
                }
                state => (state, None),
            }
        };
        publish_all(event);
        Ok(state)
    }

    pub(crate) fn record_success_at(&self, now: Duration) {
        let event = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.successes += 1;
                    if inner.successes >= self.success_threshold {
                        inner.close();
                        Some(self.state_change(&inner))
                    } else {
                        None
                    }
                }
                CircuitState::Closed => {
                    inner.detector.mark_success(now);
                    None
                }
                _ => None,
            }
        };
        publish_all(event);
    }

    pub(crate) fn record_failure_at(&self, message: String, now: Duration) {
        let event = {
            let mut inner = self.lock();
            inner.last_error = Some(message);
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.open(now, true);
                    Some(self.state_change(&inner))
                }
                CircuitState::Closed => {
                    inner.detector.mark_failed(now);
                    if inner.detector.should_trip(now) {
                        inner.open(now, false);
                        info!(
                            name = %self.name,
                            last_error = inner.last_error.as_deref().unwrap_or(""),
                            errors = inner.detector.metrics().errors,
                            error_timeout = inner.error_timeout.as_secs_f64(),
                            "circuit opened"
                        );
                        Some(self.state_change(&inner))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        publish_all(event);
    }

    fn state_change(&self, inner: &Inner) -> Event {
        Event::StateChange {
            name: Arc::clone(&self.name),
            state: inner.state,
            metrics: inner.detector.metrics(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn cooldown_elapsed(&self, now: Duration) -> bool {
        match self.opened_at {
            Some(opened_at) => now.saturating_sub(opened_at) >= self.error_timeout,
            None => true,
        }
    }

    fn open(&mut self, now: Duration, probe_failed: bool) {
        if probe_failed {
            if let Some(backoff) = &mut self.backoff {
                backoff.advance();
                self.error_timeout = backoff.current();
            }
        }
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.successes = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.successes = 0;
        self.detector.reset();
        if let Some(backoff) = &mut self.backoff {
            backoff.reset();
            self.error_timeout = backoff.current();
        }
    }
}

fn publish_all(event: Option<Event>) {
    if let Some(event) = event {
        events::publish(&event);
    }
}
