// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The PID controller driving the adaptive rejection rate.
//!
//! Hot path: recording an outcome is one atomic increment, and the
//! per-request rejection decision is one atomic load plus a coin flip. The
//! window update (PID math, estimator maintenance) runs at most once per
//! window across the whole host: workers race for the tick semaphore and
//! losers skip the update.

use crate::adaptive::shared::{AdaptiveShared, WindowCounts, SHARED_SIZE};
use crate::breaker::CircuitState;
use crate::config::AdaptiveConfig;
use crate::error::Error;
use crate::events::{self, Event};
use crate::time;
use crate::Outcome;
use rand::Rng;
use semian_ipc::key::{self, DEFAULT_PERMISSIONS};
use semian_ipc::shm::{MappedMem, NamedShmHandle, ShmHandle};
use semian_ipc::sysv::SemaphoreSet;
use std::ffi::CString;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Bound on the PID integral term, in both directions.
const INTEGRAL_LIMIT: f64 = 10.0;

/// Ceiling applied to the ideal error rate derived from history.
const IDEAL_ERROR_RATE_CAP: f64 = 0.1;

const ADAPTIVE_TYPE_TAG: &str = "adaptive";

const TICK_SEM: u16 = 0;

enum Backing {
    /// Host-shared segment plus the SysV semaphore electing a tick winner.
    Shared {
        mem: MappedMem<NamedShmHandle>,
        path: CString,
        tick: SemaphoreSet,
    },
    /// Process-local fallback with identical semantics.
    Local {
        mem: MappedMem<ShmHandle>,
        tick: Mutex<()>,
    },
}

pub(crate) struct AdaptiveController {
    name: Arc<str>,
    config: AdaptiveConfig,
    backing: Backing,
}

impl AdaptiveController {
    /// Attaches to (or creates) the host-shared controller state.
    pub(crate) fn shared(name: Arc<str>, config: AdaptiveConfig) -> Result<Self, Error> {
        let path = key::shm_path(&name, DEFAULT_PERMISSIONS, ADAPTIVE_TYPE_TAG, 0);
        let (handle, _created) =
            NamedShmHandle::create_or_open(path.clone(), SHARED_SIZE, DEFAULT_PERMISSIONS)
                .map_err(|e| Error::syscall(&name, e))?;
        let mem = handle.map().map_err(|e| Error::syscall(&name, e))?;

        let attach = SemaphoreSet::allocate(&name, ADAPTIVE_TYPE_TAG, 1, DEFAULT_PERMISSIONS)
            .map_err(|e| Error::syscall(&name, e))?;
        if attach.created {
            // semop rather than SETVAL: it also stamps sem_otime, which is
            // the signal attachers wait on.
            attach
                .set
                .adjust(TICK_SEM, 1, None)
                .map_err(|e| Error::syscall(&name, e))?;
        } else {
            attach
                .set
                .wait_until_initialized(Duration::from_secs(5))
                .map_err(|e| Error::syscall(&name, e))?;
        }

        let controller = AdaptiveController {
            name,
            config,
            backing: Backing::Shared {
                mem,
                path,
                tick: attach.set,
            },
        };
        controller.initialize();
        Ok(controller)
    }

    /// Process-local controller used when kernel IPC is disabled.
    pub(crate) fn local(name: Arc<str>, config: AdaptiveConfig) -> Result<Self, Error> {
        let mem = ShmHandle::new(SHARED_SIZE)
            .and_then(|handle| handle.map())
            .map_err(|e| Error::syscall(&name, e))?;
        let controller = AdaptiveController {
            name,
            config,
            backing: Backing::Local {
                mem,
                tick: Mutex::new(()),
            },
        };
        controller.initialize();
        Ok(controller)
    }

    fn initialize(&self) {
        self.state()
            .ensure_initialized(self.config.initial_error_rate, now_ns(None));
    }

    fn state(&self) -> &AdaptiveShared {
        // The segment is sized and aligned for AdaptiveShared and only ever
        // mutated through atomics.
        match &self.backing {
            Backing::Shared { mem, .. } => unsafe { mem.shared() },
            Backing::Local { mem, .. } => unsafe { mem.shared() },
        }
    }

    pub(crate) fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub(crate) fn window_size(&self) -> Duration {
        self.config.window_size
    }

    pub(crate) fn rejection_rate(&self) -> f64 {
        self.state().rejection_rate()
    }

    /// Per-request rejection coin flip against the current rate.
    pub(crate) fn should_reject(&self) -> bool {
        let rate = self.rejection_rate();
        rate > 0.0 && rand::thread_rng().gen::<f64>() < rate
    }

    pub(crate) fn record(&self, outcome: Outcome) {
        self.state().record(outcome);
    }

    /// State derived from the continuous rejection rate.
    pub(crate) fn derived_state(&self) -> CircuitState {
        let rate = self.rejection_rate();
        if rate <= 0.0 {
            CircuitState::Closed
        } else if rate >= self.config.max_rejection_rate {
            CircuitState::Open
        } else {
            CircuitState::PartiallyOpen
        }
    }

    /// One window update. Runs the PID step if this worker wins the tick
    /// and the window has actually elapsed; otherwise does nothing.
    pub(crate) fn tick(&self, at: Option<Duration>) {
        let now = now_ns(at);
        match &self.backing {
            Backing::Shared { tick, .. } => {
                let guard = match tick.try_scoped_wait(TICK_SEM) {
                    Ok(Some(guard)) => guard,
                    Ok(None) => return,
                    Err(err) => {
                        debug!(name = %self.name, %err, "tick semaphore unavailable");
                        return;
                    }
                };
                self.update_window(now);
                drop(guard);
            }
            Backing::Local { tick, .. } => {
                let Ok(guard) = tick.try_lock() else { return };
                self.update_window(now);
                drop(guard);
            }
        }
    }

    fn update_window(&self, now: u64) {
        let state = self.state();
        let last = state.last_update_ns();
        let elapsed_ns = now.saturating_sub(last);
        if elapsed_ns < self.config.window_size.as_nanos() as u64 {
            // Another worker already closed this window.
            return;
        }
        let dt = elapsed_ns as f64 / 1e9;

        let counts: WindowCounts = state.take_window(now);
        let error_rate = counts.error_rate();

        let mut estimator = state.load_estimator();
        estimator.observe(error_rate);
        state.store_estimator(&estimator);
        state.push_history(error_rate);
        let ideal_error_rate = estimator.query().min(IDEAL_ERROR_RATE_CAP);

        let rate = state.rejection_rate();
        let p_value = (error_rate - ideal_error_rate) - rate;
        let previous_p_value = state.previous_p_value();
        let derivative = (p_value - previous_p_value) / dt;

        let integral = state.integral();
        let mut accumulated =
            (integral + p_value * dt).clamp(-INTEGRAL_LIMIT, INTEGRAL_LIMIT);
        let control_signal = self.config.kp * p_value
            + self.config.ki * accumulated
            + self.config.kd * derivative;
        let unclamped = rate + control_signal;

        // Back-calculation anti-windup: when the output saturates and the
        // integral keeps pushing into the rail, keep the old accumulation.
        if (unclamped >= self.config.max_rejection_rate && p_value > 0.0)
            || (unclamped <= 0.0 && p_value < 0.0)
        {
            accumulated = integral;
        }
        let control_signal = self.config.kp * p_value
            + self.config.ki * accumulated
            + self.config.kd * derivative;
        let new_rate = (rate + control_signal).clamp(0.0, self.config.max_rejection_rate);

        state.set_integral(accumulated);
        state.set_previous_p_value(p_value);
        state.set_rejection_rate(new_rate);

        events::publish(&Event::AdaptiveUpdate {
            name: Arc::clone(&self.name),
            error_rate,
            rejection_rate: new_rate,
        });
        if (new_rate == 0.0) != (rate == 0.0) {
            events::publish(&Event::StateChange {
                name: Arc::clone(&self.name),
                state: self.derived_state(),
                metrics: Default::default(),
            });
        }
    }

    /// Forces the controller back to full admission.
    pub(crate) fn reset(&self) {
        self.state().clear();
        events::publish(&Event::StateChange {
            name: Arc::clone(&self.name),
            state: CircuitState::Closed,
            metrics: Default::default(),
        });
    }

    /// Removes host-wide kernel objects. The in-process mapping stays valid
    /// until the controller is dropped.
    pub(crate) fn destroy(&self) -> Result<(), Error> {
        if let Backing::Shared { path, tick, .. } = &self.backing {
            NamedShmHandle::unlink(path).map_err(|e| Error::syscall(&self.name, e))?;
            tick.remove().map_err(|e| Error::syscall(&self.name, e))?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn integral(&self) -> f64 {
        self.state().integral()
    }

    #[cfg(test)]
    pub(crate) fn history(&self) -> Vec<f64> {
        self.state().history()
    }
}

fn now_ns(at: Option<Duration>) -> u64 {
    time::resolve(at).as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DEFAULT_INITIAL_ERROR_RATE, DEFAULT_KD, DEFAULT_KI, DEFAULT_KP,
        DEFAULT_MAX_REJECTION_RATE,
    };

    fn config(window_secs: u64) -> AdaptiveConfig {
        AdaptiveConfig {
            kp: DEFAULT_KP,
            ki: DEFAULT_KI,
            kd: DEFAULT_KD,
            window_size: Duration::from_secs(window_secs),
            initial_error_rate: DEFAULT_INITIAL_ERROR_RATE,
            max_rejection_rate: DEFAULT_MAX_REJECTION_RATE,
        }
    }

    fn controller(window_secs: u64) -> AdaptiveController {
        AdaptiveController::local("adaptive-test".into(), config(window_secs)).unwrap()
    }

    fn run_window(
        controller: &AdaptiveController,
        at: Duration,
        successes: u64,
        errors: u64,
    ) -> f64 {
        for _ in 0..successes {
            controller.record(Outcome::Success);
        }
        for _ in 0..errors {
            controller.record(Outcome::Error);
        }
        controller.tick(Some(at));
        controller.rejection_rate()
    }

    #[test]
    fn rejection_rate_stays_zero_on_healthy_traffic() {
        let controller = controller(1);
        let mut at = crate::time::monotonic();
        for _ in 0..20 {
            at += Duration::from_secs(1);
            let rate = run_window(&controller, at, 100, 1);
            assert_eq!(rate, 0.0);
        }
        assert_eq!(controller.derived_state(), CircuitState::Closed);
    }

    #[test]
    fn sustained_errors_raise_the_rate_and_recovery_clears_it() {
        let controller = controller(1);
        let mut at = crate::time::monotonic();

        let mut last_rate = 0.0;
        for _ in 0..30 {
            at += Duration::from_secs(1);
            last_rate = run_window(&controller, at, 0, 100);
            assert!((0.0..=1.0).contains(&last_rate));
            assert!(controller.integral().abs() <= INTEGRAL_LIMIT);
        }
        assert!(last_rate > 0.5, "rate only reached {last_rate}");
        assert_ne!(controller.derived_state(), CircuitState::Closed);

        // Full recovery: the controller must walk the rate back to zero
        // within a bounded number of windows.
        let mut recovered = false;
        for _ in 0..60 {
            at += Duration::from_secs(1);
            if run_window(&controller, at, 100, 0) == 0.0 {
                recovered = true;
                break;
            }
        }
        assert!(recovered, "rate never returned to zero");
        assert_eq!(controller.derived_state(), CircuitState::Closed);
    }

    #[test]
    fn rate_saturates_at_the_ceiling() {
        let mut config = config(1);
        config.max_rejection_rate = 0.8;
        let controller =
            AdaptiveController::local("adaptive-ceiling".into(), config).unwrap();
        let mut at = crate::time::monotonic();
        for _ in 0..60 {
            at += Duration::from_secs(1);
            run_window(&controller, at, 0, 50);
        }
        assert!(controller.rejection_rate() <= 0.8);
        assert_eq!(controller.derived_state(), CircuitState::Open);
        assert!(controller.integral().abs() <= INTEGRAL_LIMIT);
    }

    #[test]
    fn early_ticks_are_skipped() {
        let controller = controller(10);
        let start = crate::time::monotonic();
        controller.record(Outcome::Error);
        // Only half the window has elapsed: no update happens.
        controller.tick(Some(start + Duration::from_secs(5)));
        assert_eq!(controller.history().len(), 0);
        controller.tick(Some(start + Duration::from_secs(30)));
        assert_eq!(controller.history().len(), 1);
    }

    #[test]
    fn reset_returns_to_full_admission() {
        let controller = controller(1);
        let mut at = crate::time::monotonic();
        for _ in 0..10 {
            at += Duration::from_secs(1);
            run_window(&controller, at, 0, 100);
        }
        assert!(controller.rejection_rate() > 0.0);
        controller.reset();
        assert_eq!(controller.rejection_rate(), 0.0);
        assert!(!controller.should_reject());
        assert_eq!(controller.derived_state(), CircuitState::Closed);
    }
}
