// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resource configuration and process-level toggles.
//!
//! Options are validated once, at registration, and never at call time. The
//! validated form is a private tree ([`ResourceConfig`]) that the
//! constructors consume; anything invalid is an [`Error::Argument`] raised
//! before any shared state is touched.

use crate::error::Error;
use std::cell::Cell;
use std::time::Duration;

pub const ENV_DISABLED: &str = "SEMIAN_DISABLED";
pub const ENV_SEMAPHORES_DISABLED: &str = "SEMIAN_SEMAPHORES_DISABLED";
pub const ENV_BULKHEAD_DISABLED: &str = "SEMIAN_BULKHEAD_DISABLED";
pub const ENV_CIRCUIT_BREAKER_DISABLED: &str = "SEMIAN_CIRCUIT_BREAKER_DISABLED";

/// Largest ticket count a semaphore slot can hold (SEMVMX).
pub const MAX_TICKETS: u32 = 32_767;

pub(crate) const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;
pub(crate) const DEFAULT_BULKHEAD_TIMEOUT: Duration = Duration::ZERO;
pub(crate) const DEFAULT_TIME_WINDOW: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_MINIMUM_REQUEST_VOLUME: u32 = 10;

pub(crate) const DEFAULT_KP: f64 = 0.5;
pub(crate) const DEFAULT_KI: f64 = 0.05;
pub(crate) const DEFAULT_KD: f64 = 0.0;
pub(crate) const DEFAULT_WINDOW_SIZE: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_INITIAL_ERROR_RATE: f64 = 0.01;
pub(crate) const DEFAULT_MAX_REJECTION_RATE: f64 = 1.0;

pub mod parse_env {
    use std::{env, str::FromStr, time::Duration};

    pub fn duration(name: &str) -> Option<Duration> {
        Some(Duration::from_secs_f32(
            env::var(name).ok()?.parse::<f32>().ok()?,
        ))
    }

    pub fn int<T: FromStr>(name: &str) -> Option<T> {
        env::var(name).ok()?.parse::<T>().ok()
    }

    pub fn bool(name: &str) -> Option<bool> {
        let var = env::var(name).ok()?;
        Some(var == "true" || var == "1")
    }
}

fn env_flag(name: &str) -> bool {
    parse_env::bool(name).unwrap_or(false)
}

/// Everything off: resources become pass-throughs.
pub fn disabled() -> bool {
    env_flag(ENV_DISABLED)
}

/// Kernel semaphores off: bulkheads are no-ops and the adaptive controller
/// falls back to process-local state.
pub fn semaphores_disabled() -> bool {
    disabled() || env_flag(ENV_SEMAPHORES_DISABLED)
}

pub fn bulkhead_disabled() -> bool {
    disabled() || semaphores_disabled() || env_flag(ENV_BULKHEAD_DISABLED)
}

pub fn circuit_breaker_disabled() -> bool {
    disabled() || env_flag(ENV_CIRCUIT_BREAKER_DISABLED)
}

thread_local! {
    static BULKHEAD_OPTOUT: Cell<u32> = const { Cell::new(0) };
}

/// Runs `f` with the bulkhead bypassed on this thread.
///
/// Nesting is allowed; the bulkhead re-engages when the outermost scope
/// exits.
pub fn without_bulkhead<T>(f: impl FnOnce() -> T) -> T {
    struct Reengage;
    impl Drop for Reengage {
        fn drop(&mut self) {
            BULKHEAD_OPTOUT.with(|depth| depth.set(depth.get() - 1));
        }
    }
    BULKHEAD_OPTOUT.with(|depth| depth.set(depth.get() + 1));
    let _reengage = Reengage;
    f()
}

pub(crate) fn bulkhead_opted_out() -> bool {
    BULKHEAD_OPTOUT.with(|depth| depth.get() > 0)
}

/// Per-resource options, all optional except the pieces that select a
/// failure detector or a bulkhead capacity.
///
/// Exactly one of `tickets` / `quota` must be set while the bulkhead is
/// enabled, and the detector options must come from a single family:
/// `error_threshold` (consecutive errors), `error_percent_threshold`
/// (error rate) or the `kp`/`ki`/`kd`/`window_size` group (adaptive).
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceOptions {
    /// Static bulkhead capacity. Mutually exclusive with `quota`.
    pub tickets: Option<u32>,
    /// Fraction of registered workers granted as tickets, in `(0, 1]`.
    pub quota: Option<f64>,
    /// How long `acquire` may wait for a ticket. Default: fail immediately.
    pub timeout: Option<Duration>,
    /// Host-wide ceiling acquired before the per-resource bulkhead.
    pub global_quota: Option<f64>,
    /// Enables the bulkhead half. Default true.
    pub bulkhead: bool,
    /// Enables the circuit-breaker half. Default true.
    pub circuit_breaker: bool,

    pub error_threshold: Option<u32>,
    pub error_timeout: Option<Duration>,
    pub success_threshold: Option<u32>,
    pub error_threshold_timeout: Option<Duration>,
    pub error_threshold_timeout_enabled: bool,
    pub half_open_resource_timeout: Option<Duration>,
    pub lumping_interval: Option<Duration>,
    pub dynamic_timeout: bool,

    pub error_percent_threshold: Option<f64>,
    pub time_window: Option<Duration>,
    pub minimum_request_volume: Option<u32>,

    pub kp: Option<f64>,
    pub ki: Option<f64>,
    pub kd: Option<f64>,
    pub window_size: Option<Duration>,
    pub initial_error_rate: Option<f64>,
    pub max_rejection_rate: Option<f64>,
}

impl Default for ResourceOptions {
    fn default() -> Self {
        ResourceOptions {
            tickets: None,
            quota: None,
            timeout: None,
            global_quota: None,
            bulkhead: true,
            circuit_breaker: true,
            error_threshold: None,
            error_timeout: None,
            success_threshold: None,
            error_threshold_timeout: None,
            error_threshold_timeout_enabled: true,
            half_open_resource_timeout: None,
            lumping_interval: None,
            dynamic_timeout: false,
            error_percent_threshold: None,
            time_window: None,
            minimum_request_volume: None,
            kp: None,
            ki: None,
            kd: None,
            window_size: None,
            initial_error_rate: None,
            max_rejection_rate: None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ResourceConfig {
    pub bulkhead: Option<BulkheadConfig>,
    pub breaker: Option<BreakerConfig>,
}

#[derive(Debug, Clone)]
pub(crate) struct BulkheadConfig {
    pub capacity: Capacity,
    pub timeout: Duration,
    pub global_quota: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Capacity {
    Static(u32),
    Quota(f64),
}

#[derive(Debug, Clone)]
pub(crate) enum BreakerConfig {
    Classic(ClassicConfig),
    Adaptive(AdaptiveConfig),
}

#[derive(Debug, Clone)]
pub(crate) struct ClassicConfig {
    pub detector: DetectorConfig,
    pub timeout: TimeoutPolicy,
    pub success_threshold: u32,
    pub half_open_resource_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum TimeoutPolicy {
    Fixed(Duration),
    Dynamic,
}

#[derive(Debug, Clone)]
pub(crate) enum DetectorConfig {
    Consecutive {
        error_threshold: u32,
        threshold_timeout: Option<Duration>,
        timeout_enabled: bool,
        lumping: Option<Duration>,
    },
    Rate {
        percent: f64,
        time_window: Duration,
        min_volume: u32,
        lumping: Option<Duration>,
    },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct AdaptiveConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub window_size: Duration,
    pub initial_error_rate: f64,
    pub max_rejection_rate: f64,
}

fn argument(msg: impl Into<String>) -> Error {
    Error::Argument(msg.into())
}

impl ResourceOptions {
    pub(crate) fn validate(&self, name: &str) -> Result<ResourceConfig, Error> {
        if !self.bulkhead && !self.circuit_breaker {
            return Err(argument(format!(
                "resource `{name}` must enable at least one of bulkhead or circuit breaker"
            )));
        }

        let bulkhead = if self.bulkhead {
            Some(self.validate_bulkhead(name)?)
        } else {
            None
        };
        let breaker = if self.circuit_breaker {
            Some(self.validate_breaker(name)?)
        } else {
            None
        };
        Ok(ResourceConfig { bulkhead, breaker })
    }

    fn validate_bulkhead(&self, name: &str) -> Result<BulkheadConfig, Error> {
        let capacity = match (self.tickets, self.quota) {
            (Some(_), Some(_)) => {
                return Err(argument(format!(
                    "resource `{name}`: tickets and quota are mutually exclusive"
                )))
            }
            (None, None) => {
                return Err(argument(format!(
                    "resource `{name}`: bulkhead requires either tickets or quota"
                )))
            }
            (Some(tickets), None) => {
                if tickets > MAX_TICKETS {
                    return Err(argument(format!(
                        "resource `{name}`: tickets must be at most {MAX_TICKETS}"
                    )));
                }
                Capacity::Static(tickets)
            }
            (None, Some(quota)) => {
                if !(quota > 0.0 && quota <= 1.0) {
                    return Err(argument(format!(
                        "resource `{name}`: quota must be in (0, 1]"
                    )));
                }
                Capacity::Quota(quota)
            }
        };
        if let Some(global) = self.global_quota {
            if !(global > 0.0 && global <= 1.0) {
                return Err(argument(format!(
                    "resource `{name}`: global_quota must be in (0, 1]"
                )));
            }
        }
        Ok(BulkheadConfig {
            capacity,
            timeout: self.timeout.unwrap_or(DEFAULT_BULKHEAD_TIMEOUT),
            global_quota: self.global_quota,
        })
    }

    fn validate_breaker(&self, name: &str) -> Result<BreakerConfig, Error> {
        let consecutive = self.error_threshold.is_some();
        let rate = self.error_percent_threshold.is_some();
        let adaptive = self.kp.is_some()
            || self.ki.is_some()
            || self.kd.is_some()
            || self.window_size.is_some()
            || self.initial_error_rate.is_some()
            || self.max_rejection_rate.is_some();

        match (consecutive, rate, adaptive) {
            (false, false, false) => Err(argument(format!(
                "resource `{name}`: circuit breaker is enabled but no failure detector is configured"
            ))),
            (true, true, _) | (true, _, true) | (_, true, true) => Err(argument(format!(
                "resource `{name}`: failure detector options mix more than one detector family"
            ))),
            (_, _, true) => self.validate_adaptive(name).map(BreakerConfig::Adaptive),
            (true, false, false) => self.validate_consecutive(name).map(BreakerConfig::Classic),
            (false, true, false) => self.validate_rate(name).map(BreakerConfig::Classic),
        }
    }

    fn validate_timeout_policy(&self, name: &str) -> Result<TimeoutPolicy, Error> {
        match (self.error_timeout, self.dynamic_timeout) {
            (Some(_), true) => Err(argument(format!(
                "resource `{name}`: dynamic_timeout and a fixed error_timeout are mutually exclusive"
            ))),
            (Some(timeout), false) => Ok(TimeoutPolicy::Fixed(timeout)),
            (None, true) => Ok(TimeoutPolicy::Dynamic),
            (None, false) => Err(argument(format!(
                "resource `{name}`: circuit breaker requires error_timeout or dynamic_timeout"
            ))),
        }
    }

    fn classic_common(&self, name: &str) -> Result<(TimeoutPolicy, u32), Error> {
        let timeout = self.validate_timeout_policy(name)?;
        let success_threshold = self.success_threshold.unwrap_or(DEFAULT_SUCCESS_THRESHOLD);
        if success_threshold == 0 {
            return Err(argument(format!(
                "resource `{name}`: success_threshold must be at least 1"
            )));
        }
        Ok((timeout, success_threshold))
    }

    fn validate_consecutive(&self, name: &str) -> Result<ClassicConfig, Error> {
        let (timeout, success_threshold) = self.classic_common(name)?;
        let error_threshold = self.error_threshold.unwrap_or_default();
        if error_threshold == 0 {
            return Err(argument(format!(
                "resource `{name}`: error_threshold must be at least 1"
            )));
        }

        // error_threshold_timeout defaults to error_timeout. With a dynamic
        // timeout and no explicit window, errors simply never go stale.
        let threshold_timeout = self.error_threshold_timeout.or(match timeout {
            TimeoutPolicy::Fixed(t) => Some(t),
            TimeoutPolicy::Dynamic => None,
        });

        if self.error_threshold_timeout_enabled {
            if let (Some(lumping), Some(window)) = (self.lumping_interval, threshold_timeout) {
                if lumping.as_secs_f64() * (error_threshold.saturating_sub(1)) as f64
                    > window.as_secs_f64()
                {
                    return Err(argument(format!(
                        "resource `{name}`: lumping_interval x (error_threshold - 1) exceeds \
                         error_threshold_timeout; the circuit could never open"
                    )));
                }
            }
        }

        Ok(ClassicConfig {
            detector: DetectorConfig::Consecutive {
                error_threshold,
                threshold_timeout,
                timeout_enabled: self.error_threshold_timeout_enabled,
                lumping: self.lumping_interval,
            },
            timeout,
            success_threshold,
            half_open_resource_timeout: self.half_open_resource_timeout,
        })
    }

    fn validate_rate(&self, name: &str) -> Result<ClassicConfig, Error> {
        let (timeout, success_threshold) = self.classic_common(name)?;
        let percent = self.error_percent_threshold.unwrap_or_default();
        if !(percent > 0.0 && percent < 1.0) {
            return Err(argument(format!(
                "resource `{name}`: error_percent_threshold must be in (0, 1) exclusive"
            )));
        }
        let min_volume = self
            .minimum_request_volume
            .unwrap_or(DEFAULT_MINIMUM_REQUEST_VOLUME);
        if min_volume == 0 {
            return Err(argument(format!(
                "resource `{name}`: minimum_request_volume must be at least 1"
            )));
        }
        Ok(ClassicConfig {
            detector: DetectorConfig::Rate {
                percent,
                time_window: self.time_window.unwrap_or(DEFAULT_TIME_WINDOW),
                min_volume,
                lumping: self.lumping_interval,
            },
            timeout,
            success_threshold,
            half_open_resource_timeout: self.half_open_resource_timeout,
        })
    }

    fn validate_adaptive(&self, name: &str) -> Result<AdaptiveConfig, Error> {
        if self.error_timeout.is_some()
            || self.dynamic_timeout
            || self.success_threshold.is_some()
            || self.half_open_resource_timeout.is_some()
            || self.lumping_interval.is_some()
        {
            return Err(argument(format!(
                "resource `{name}`: classic breaker options do not apply to the adaptive breaker"
            )));
        }
        let config = AdaptiveConfig {
            kp: self.kp.unwrap_or(DEFAULT_KP),
            ki: self.ki.unwrap_or(DEFAULT_KI),
            kd: self.kd.unwrap_or(DEFAULT_KD),
            window_size: self.window_size.unwrap_or(DEFAULT_WINDOW_SIZE),
            initial_error_rate: self.initial_error_rate.unwrap_or(DEFAULT_INITIAL_ERROR_RATE),
            max_rejection_rate: self
                .max_rejection_rate
                .unwrap_or(DEFAULT_MAX_REJECTION_RATE),
        };
        for (label, value) in [("kp", config.kp), ("ki", config.ki), ("kd", config.kd)] {
            if !value.is_finite() || value < 0.0 {
                return Err(argument(format!(
                    "resource `{name}`: {label} must be finite and non-negative"
                )));
            }
        }
        if config.window_size.is_zero() {
            return Err(argument(format!(
                "resource `{name}`: window_size must be positive"
            )));
        }
        if !(0.0..=1.0).contains(&config.initial_error_rate) {
            return Err(argument(format!(
                "resource `{name}`: initial_error_rate must be in [0, 1]"
            )));
        }
        if !(config.max_rejection_rate > 0.0 && config.max_rejection_rate <= 1.0) {
            return Err(argument(format!(
                "resource `{name}`: max_rejection_rate must be in (0, 1]"
            )));
        }
        Ok(config)
    }
}
