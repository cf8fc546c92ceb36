// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The process-wide resource registry.
//!
//! An ordered map in least-recently-used order: every hit moves the entry
//! to the back, so eviction scans from the front and can stop at the first
//! entry younger than the age floor. Entries whose breaker is not closed
//! (or whose bulkhead has tickets outstanding) are never evicted.
//!
//! The registry notices a fork by comparing pids: the child starts over and
//! resources re-register lazily, which also re-increments the shared worker
//! counters under the child's own pid.

use crate::config::ResourceOptions;
use crate::error::Error;
use crate::events::{self, Event};
use crate::resource::Resource;
use crate::time;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::warn;

/// Entries idle for less than this are safe from eviction.
const DEFAULT_MIN_LRU_AGE: Duration = Duration::from_secs(300);

struct Entry {
    resource: Arc<Resource>,
    last_access: Duration,
}

struct RegistryInner {
    resources: IndexMap<String, Entry>,
    pid: u32,
}

pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
    /// 0 means unbounded.
    max_size: AtomicUsize,
    min_lru_age_ms: AtomicU64,
}

static GLOBAL: LazyLock<Registry> = LazyLock::new(Registry::new);

pub(crate) fn global() -> &'static Registry {
    &GLOBAL
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            inner: Mutex::new(RegistryInner {
                resources: IndexMap::new(),
                pid: std::process::id(),
            }),
            max_size: AtomicUsize::new(0),
            min_lru_age_ms: AtomicU64::new(DEFAULT_MIN_LRU_AGE.as_millis() as u64),
        }
    }

    pub(crate) fn set_max_size(&self, max: usize) {
        self.max_size.store(max, Ordering::Relaxed);
    }

    pub(crate) fn set_min_lru_age(&self, age: Duration) {
        self.min_lru_age_ms
            .store(age.as_millis() as u64, Ordering::Relaxed);
    }

    fn min_lru_age(&self) -> Duration {
        Duration::from_millis(self.min_lru_age_ms.load(Ordering::Relaxed))
    }

    /// Registers `name`, or returns the existing entry when the options
    /// match. Differing options on an existing name are an error.
    pub(crate) fn register(
        &self,
        name: &str,
        options: ResourceOptions,
    ) -> Result<Arc<Resource>, Error> {
        self.insert(name, options, true)
    }

    /// Like [`Registry::register`] but an existing entry wins regardless of
    /// how its options compare.
    pub(crate) fn retrieve_or_register(
        &self,
        name: &str,
        options: ResourceOptions,
    ) -> Result<Arc<Resource>, Error> {
        self.insert(name, options, false)
    }

    fn insert(
        &self,
        name: &str,
        options: ResourceOptions,
        validate_match: bool,
    ) -> Result<Arc<Resource>, Error> {
        let now = time::monotonic();
        let mut inner = self.lock();
        Self::check_fork(&mut inner);

        if inner.resources.contains_key(name) {
            if validate_match {
                let entry = &inner.resources[name];
                if entry.resource.options() != &options {
                    return Err(Error::Argument(format!(
                        "resource `{name}` is already registered with different options"
                    )));
                }
            }
            return Ok(Self::touch(&mut inner, name, now));
        }

        let gc = self.evict_locked(&mut inner, now);
        let resource = Resource::build(name, options)?;
        inner.resources.insert(
            name.to_string(),
            Entry {
                resource: Arc::clone(&resource),
                last_access: now,
            },
        );
        drop(inner);
        if let Some(event) = gc {
            events::publish(&event);
        }
        Ok(resource)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<Resource>> {
        let now = time::monotonic();
        let mut inner = self.lock();
        Self::check_fork(&mut inner);
        if !inner.resources.contains_key(name) {
            return None;
        }
        Some(Self::touch(&mut inner, name, now))
    }

    /// Drops the process-local entry. Kernel objects survive; the worker
    /// registration is released by the resource's own teardown.
    pub(crate) fn unregister(&self, name: &str) {
        let mut inner = self.lock();
        inner.resources.shift_remove(name);
    }

    /// Removes the entry and its kernel objects. Idempotent.
    pub(crate) fn destroy(&self, name: &str) -> Result<(), Error> {
        let removed = {
            let mut inner = self.lock();
            inner.resources.shift_remove(name)
        };
        match removed {
            Some(entry) => entry.resource.destroy(),
            None => Ok(()),
        }
    }

    /// Tears down every registered resource and its kernel objects.
    pub(crate) fn reset_all(&self) {
        let drained: Vec<(String, Entry)> = {
            let mut inner = self.lock();
            inner.resources.drain(..).collect()
        };
        for (name, entry) in drained {
            if let Err(err) = entry.resource.destroy() {
                warn!(name = %name, %err, "failed to destroy resource during reset");
            }
        }
    }

    /// Child-side fork hook: forget inherited entries so resources
    /// re-register lazily under the child's pid.
    pub(crate) fn after_fork(&self) {
        let mut inner = self.lock();
        inner.resources.clear();
        inner.pid = std::process::id();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().resources.len()
    }

    fn check_fork(inner: &mut MutexGuard<'_, RegistryInner>) {
        let pid = std::process::id();
        if inner.pid != pid {
            inner.resources.clear();
            inner.pid = pid;
        }
    }

    fn touch(
        inner: &mut MutexGuard<'_, RegistryInner>,
        name: &str,
        now: Duration,
    ) -> Arc<Resource> {
        let index = inner
            .resources
            .get_index_of(name)
            .expect("touch requires an existing entry");
        let last = inner.resources.len() - 1;
        inner.resources.move_index(index, last);
        let entry = &mut inner.resources[last];
        entry.last_access = now;
        Arc::clone(&entry.resource)
    }

    /// Insert-time eviction: with a cap and at capacity, clear idle entries
    /// from the least-recently-used end.
    fn evict_locked(
        &self,
        inner: &mut MutexGuard<'_, RegistryInner>,
        now: Duration,
    ) -> Option<Event> {
        let max = self.max_size.load(Ordering::Relaxed);
        if max == 0 || inner.resources.len() < max {
            return None;
        }
        let min_age = self.min_lru_age();
        let started = Instant::now();
        let mut examined = 0;
        let mut cleared = 0;

        let mut index = 0;
        while index < inner.resources.len() {
            let entry = &inner.resources[index];
            // Access stamps are monotonic in map order, so the first young
            // entry ends the scan.
            if now.saturating_sub(entry.last_access) < min_age {
                break;
            }
            examined += 1;
            if entry.resource.in_use() {
                index += 1;
                continue;
            }
            inner.resources.shift_remove_index(index);
            cleared += 1;
        }

        Some(Event::LruGc {
            size: inner.resources.len(),
            examined,
            cleared,
            elapsed: started.elapsed(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn breaker_options(threshold: u32) -> ResourceOptions {
        ResourceOptions {
            bulkhead: false,
            error_threshold: Some(threshold),
            error_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        }
    }

    #[test]
    fn register_is_idempotent_for_matching_options() {
        let registry = Registry::new();
        let first = registry.register("db", breaker_options(2)).unwrap();
        let second = registry.register("db", breaker_options(2)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn register_rejects_differing_options() {
        let registry = Registry::new();
        registry.register("db", breaker_options(2)).unwrap();
        let err = registry.register("db", breaker_options(3)).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));

        // The variant without validation returns the existing entry.
        let existing = registry
            .retrieve_or_register("db", breaker_options(3))
            .unwrap();
        assert_eq!(
            existing.circuit_breaker().unwrap().metrics().errors,
            0
        );
    }

    #[test]
    fn lookup_returns_the_registered_resource() {
        let registry = Registry::new();
        assert!(registry.lookup("db").is_none());
        let registered = registry.register("db", breaker_options(2)).unwrap();
        let found = registry.lookup("db").unwrap();
        assert!(Arc::ptr_eq(&registered, &found));
    }

    #[test]
    fn destroy_is_idempotent() {
        let registry = Registry::new();
        registry.register("db", breaker_options(2)).unwrap();
        registry.destroy("db").unwrap();
        registry.destroy("db").unwrap();
        assert!(registry.lookup("db").is_none());
    }

    #[test]
    fn eviction_clears_idle_entries_at_capacity() {
        let registry = Registry::new();
        registry.set_max_size(2);
        registry.set_min_lru_age(Duration::ZERO);

        registry.register("a", breaker_options(1)).unwrap();
        registry.register("b", breaker_options(1)).unwrap();

        let gc_events = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&gc_events);
        let subscription = events::subscribe(None, move |event| {
            if matches!(event, Event::LruGc { .. }) {
                captured.fetch_add(1, Ordering::SeqCst);
            }
        });

        registry.register("c", breaker_options(1)).unwrap();
        assert!(registry.len() <= 2);
        // Other tests can publish their own gc passes concurrently.
        assert!(gc_events.load(Ordering::SeqCst) >= 1);

        events::unsubscribe(subscription);
    }

    #[test]
    fn open_breakers_are_never_evicted() {
        let registry = Registry::new();
        registry.set_max_size(1);
        registry.set_min_lru_age(Duration::ZERO);

        let guarded = registry.register("flaky", breaker_options(1)).unwrap();
        guarded
            .circuit_breaker()
            .unwrap()
            .record_failure_at("down".into(), time::monotonic());
        assert!(guarded.circuit_state() == Some(crate::breaker::CircuitState::Open));

        registry.register("other", breaker_options(1)).unwrap();
        assert!(registry.lookup("flaky").is_some());
    }

    #[test]
    fn entries_younger_than_the_age_floor_survive() {
        let registry = Registry::new();
        registry.set_max_size(1);
        // Default floor: everything is too young to evict.
        registry.register("a", breaker_options(1)).unwrap();
        registry.register("b", breaker_options(1)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unregister_removes_without_destroying() {
        let registry = Registry::new();
        registry.register("db", breaker_options(1)).unwrap();
        registry.unregister("db");
        assert!(registry.lookup("db").is_none());
    }

    #[test]
    fn reset_all_empties_the_registry() {
        let registry = Registry::new();
        registry.register("a", breaker_options(1)).unwrap();
        registry.register("b", breaker_options(1)).unwrap();
        registry.reset_all();
        assert_eq!(registry.len(), 0);
    }
}
