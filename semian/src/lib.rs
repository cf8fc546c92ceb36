// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client-side resiliency for external dependencies.
//!
//! A *resource* is one logical dependency (a database, a cache, an RPC
//! endpoint) guarded by two composable mechanisms:
//!
//! - a **bulkhead**, a cross-process counting semaphore that caps how many
//!   calls the whole host has in flight against the dependency, and
//! - a **circuit breaker**, which watches call outcomes and fails fast once
//!   the dependency looks unhealthy.
//!
//! Both survive worker crashes: bulkhead tickets and worker registrations
//! are repaired by kernel undo semantics, and the adaptive breaker's shared
//! controller state lives in named shared memory.
//!
//! ```no_run
//! use semian::{AcquireOptions, ResourceOptions};
//! use std::time::Duration;
//!
//! let resource = semian::register(
//!     "mysql_primary",
//!     ResourceOptions {
//!         tickets: Some(3),
//!         timeout: Some(Duration::from_millis(500)),
//!         error_threshold: Some(3),
//!         error_timeout: Some(Duration::from_secs(10)),
//!         success_threshold: Some(2),
//!         ..Default::default()
//!     },
//! )?;
//!
//! let rows = resource.acquire(AcquireOptions::default(), || {
//!     // talk to the dependency
//!     Ok::<_, std::io::Error>(42)
//! })?;
//! # let _ = rows;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Process-wide toggles come from the environment: `SEMIAN_DISABLED`,
//! `SEMIAN_SEMAPHORES_DISABLED`, `SEMIAN_BULKHEAD_DISABLED` and
//! `SEMIAN_CIRCUIT_BREAKER_DISABLED`. Kernel coordination requires unix;
//! with semaphores disabled, resources degrade to process-local behavior.

mod adaptive;
pub mod breaker;
mod bulkhead;
pub mod config;
mod error;
pub mod events;
mod registry;
mod resource;
mod time;
mod window;

pub use breaker::{CircuitBreaker, CircuitState, HalfOpenTimeout};
pub use breaker::detector::DetectorMetrics;
pub use bulkhead::Bulkhead;
pub use config::{without_bulkhead, ResourceOptions};
pub use error::{AcquireError, Error, MarksCircuits};
pub use events::{subscribe, unsubscribe, Event, SubscriptionId};
pub use resource::{AcquireOptions, Resource};

use std::sync::Arc;
use std::time::Duration;

/// How a guarded call ended, as the breakers see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
    Rejected,
}

/// Registers `name`, creating its guards on first use.
///
/// Idempotent per name and options; re-registering with different options
/// is an [`Error::Argument`].
pub fn register(name: &str, options: ResourceOptions) -> Result<Arc<Resource>, Error> {
    registry::global().register(name, options)
}

/// Returns the existing resource for `name`, registering it when absent.
/// Unlike [`register`], an existing entry wins even when the options differ.
pub fn retrieve_or_register(
    name: &str,
    options: ResourceOptions,
) -> Result<Arc<Resource>, Error> {
    registry::global().retrieve_or_register(name, options)
}

/// The resource registered under `name`, if any.
pub fn lookup(name: &str) -> Option<Arc<Resource>> {
    registry::global().lookup(name)
}

/// Drops the process-local registration without touching kernel objects.
pub fn unregister(name: &str) {
    registry::global().unregister(name)
}

/// Removes `name` and frees its kernel objects. Safe to repeat.
pub fn destroy(name: &str) -> Result<(), Error> {
    registry::global().destroy(name)
}

/// Tears down every registered resource and its kernel objects.
pub fn reset_all() {
    registry::global().reset_all()
}

/// Child-side hook to call after `fork`: clears the registry so resources
/// re-register (and re-count their worker registration) lazily on next use.
pub fn after_fork() {
    registry::global().after_fork()
}

/// Caps the registry size; 0 (the default) means unbounded.
pub fn set_max_resources(max: usize) {
    registry::global().set_max_size(max)
}

/// Entries idle for less than this age are exempt from registry eviction.
pub fn set_min_lru_age(age: Duration) {
    registry::global().set_min_lru_age(age)
}
