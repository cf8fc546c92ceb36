// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A named resource: the composition of a bulkhead and a circuit breaker.
//!
//! Acquisition order is bulkhead outside, breaker inside: a ticket timeout
//! surfaces before the breaker is consulted and is never recorded as a
//! circuit error. Either half can be disabled by options or environment;
//! a disabled half simply admits everything.

use crate::adaptive::AdaptiveBreaker;
use crate::breaker::{CircuitBreaker, CircuitState, HalfOpenTimeout};
use crate::bulkhead::Bulkhead;
use crate::config::{self, BreakerConfig, BulkheadConfig, Capacity, ResourceOptions};
use crate::error::{AcquireError, Error, MarksCircuits};
use crate::events::{self, Event};
use std::sync::Arc;
use std::time::Duration;

/// Name under which the optional host-global ceiling registers its
/// semaphore set.
const GLOBAL_BULKHEAD_NAME: &str = "semian-global";

/// Per-call knobs for [`Resource::acquire`].
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Overrides the resource's configured bulkhead wait.
    pub timeout: Option<Duration>,
}

pub(crate) enum BreakerSlot {
    Classic(CircuitBreaker),
    Adaptive(AdaptiveBreaker),
}

pub struct Resource {
    name: Arc<str>,
    options: ResourceOptions,
    bulkhead: Option<Bulkhead>,
    global_bulkhead: Option<Bulkhead>,
    breaker: Option<BreakerSlot>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

impl Resource {
    /// Validates options and builds the enabled halves. Shared state is
    /// only touched after validation passes.
    pub(crate) fn build(name: &str, options: ResourceOptions) -> Result<Arc<Resource>, Error> {
        let resource_config = options.validate(name)?;
        let name: Arc<str> = name.into();

        let bulkhead_config = resource_config
            .bulkhead
            .filter(|_| !config::bulkhead_disabled());
        let breaker_config = resource_config
            .breaker
            .filter(|_| !config::circuit_breaker_disabled());

        let global_bulkhead = match &bulkhead_config {
            Some(BulkheadConfig {
                global_quota: Some(quota),
                timeout,
                ..
            }) => Some(Bulkhead::new(
                GLOBAL_BULKHEAD_NAME.into(),
                &BulkheadConfig {
                    capacity: Capacity::Quota(*quota),
                    timeout: *timeout,
                    global_quota: None,
                },
            )?),
            _ => None,
        };
        let bulkhead = bulkhead_config
            .map(|cfg| Bulkhead::new(Arc::clone(&name), &cfg))
            .transpose()?;
        let breaker = breaker_config
            .map(|cfg| match cfg {
                BreakerConfig::Classic(classic) => Ok(BreakerSlot::Classic(CircuitBreaker::new(
                    Arc::clone(&name),
                    &classic,
                ))),
                BreakerConfig::Adaptive(adaptive) => Ok(BreakerSlot::Adaptive(
                    AdaptiveBreaker::new(Arc::clone(&name), adaptive, !config::semaphores_disabled())?,
                )),
            })
            .transpose()?;

        Ok(Arc::new(Resource {
            name,
            options,
            bulkhead,
            global_bulkhead,
            breaker,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn options(&self) -> &ResourceOptions {
        &self.options
    }

    /// Runs `work` under the bulkhead and breaker.
    pub fn acquire<T, E, F>(&self, options: AcquireOptions, work: F) -> Result<T, AcquireError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: MarksCircuits + std::error::Error + 'static,
    {
        self.acquire_with_probe(options, None, work)
    }

    /// [`Resource::acquire`] with a hook the breaker uses to shorten the
    /// downstream client timeout during a half-open probe.
    pub fn acquire_with_probe<T, E, F>(
        &self,
        options: AcquireOptions,
        probe_override: Option<&dyn HalfOpenTimeout>,
        work: F,
    ) -> Result<T, AcquireError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: MarksCircuits + std::error::Error + 'static,
    {
        let bypass_bulkhead = config::bulkhead_opted_out();
        let _global_ticket = match (&self.global_bulkhead, bypass_bulkhead) {
            (Some(bulkhead), false) => Some(bulkhead.ticket(options.timeout)?),
            _ => None,
        };
        let _ticket = match (&self.bulkhead, bypass_bulkhead) {
            (Some(bulkhead), false) => Some(bulkhead.ticket(options.timeout)?),
            _ => None,
        };

        let result = match &self.breaker {
            Some(BreakerSlot::Classic(breaker)) => breaker.acquire(probe_override, work),
            Some(BreakerSlot::Adaptive(breaker)) => breaker.acquire(work),
            None => work().map_err(AcquireError::Work),
        };
        match &result {
            Ok(_) => events::publish(&Event::Success {
                name: Arc::clone(&self.name),
            }),
            Err(AcquireError::Work(err)) if err.marks_circuits() => {
                events::publish(&Event::Error {
                    name: Arc::clone(&self.name),
                })
            }
            _ => {}
        }
        result
    }

    /// Forces the breaker closed and clears its windows.
    pub fn reset(&self) {
        match &self.breaker {
            Some(BreakerSlot::Classic(breaker)) => breaker.reset(),
            Some(BreakerSlot::Adaptive(breaker)) => breaker.reset(),
            None => {}
        }
    }

    /// Would a call be admitted by the breaker right now? Pure.
    pub fn request_allowed(&self) -> bool {
        match &self.breaker {
            Some(BreakerSlot::Classic(breaker)) => breaker.request_allowed(),
            Some(BreakerSlot::Adaptive(breaker)) => breaker.request_allowed(),
            None => true,
        }
    }

    /// The breaker's current state, when one is configured.
    pub fn circuit_state(&self) -> Option<CircuitState> {
        match &self.breaker {
            Some(BreakerSlot::Classic(breaker)) => Some(breaker.state()),
            Some(BreakerSlot::Adaptive(breaker)) => Some(breaker.state()),
            None => None,
        }
    }

    /// The classic breaker, for callers that inspect error timeouts or the
    /// last recorded error.
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        match &self.breaker {
            Some(BreakerSlot::Classic(breaker)) => Some(breaker),
            _ => None,
        }
    }

    /// The adaptive rejection rate, when the adaptive breaker is configured.
    pub fn rejection_rate(&self) -> Option<f64> {
        match &self.breaker {
            Some(BreakerSlot::Adaptive(breaker)) => Some(breaker.rejection_rate()),
            _ => None,
        }
    }

    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }

    /// True while the breaker is not closed or tickets are outstanding;
    /// such a resource is exempt from registry eviction.
    pub fn in_use(&self) -> bool {
        let breaker_busy = match &self.breaker {
            Some(BreakerSlot::Classic(breaker)) => breaker.in_use(),
            Some(BreakerSlot::Adaptive(breaker)) => breaker.in_use(),
            None => false,
        };
        breaker_busy || self.bulkhead.as_ref().is_some_and(Bulkhead::in_use)
    }

    /// Removes this resource's kernel objects. The host-global ceiling is
    /// shared with other resources and survives.
    pub(crate) fn destroy(&self) -> Result<(), Error> {
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.destroy()?;
        }
        if let Some(BreakerSlot::Adaptive(breaker)) = &self.breaker {
            breaker.destroy()?;
        }
        Ok(())
    }
}
