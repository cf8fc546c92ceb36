// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The bulkhead: a host-wide cap on in-flight calls to one dependency.
//!
//! Four semaphore slots per resource: a setup lock serializing membership
//! changes, the ticket slot callers wait on, the registered-worker count,
//! and a mirror of the last configured ticket total so joiners can compute
//! resize deltas. Ticket waits and worker registration carry `SEM_UNDO`;
//! resize deltas do not, because they must outlive the worker that applied
//! them.

use crate::config::{BulkheadConfig, Capacity};
use crate::error::Error;
use semian_ipc::key::DEFAULT_PERMISSIONS;
use semian_ipc::sysv::{SemGuard, SemaphoreSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SEM_LOCK: u16 = 0;
const SEM_TICKETS: u16 = 1;
const SEM_WORKERS: u16 = 2;
const SEM_CONFIGURED: u16 = 3;
const SLOT_COUNT: u16 = 4;

const BULKHEAD_TYPE_TAG: &str = "bulkhead";

/// Budget for joining, leaving and resizing. A resize can wait on in-flight
/// holders, so this is deliberately generous.
const MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Bulkhead {
    name: Arc<str>,
    set: SemaphoreSet,
    capacity: Capacity,
    timeout: Duration,
    // Drop must not unregister a membership this process never took, which
    // is exactly what would happen in a forked child.
    owner_pid: u32,
}

impl Bulkhead {
    pub(crate) fn new(name: Arc<str>, config: &BulkheadConfig) -> Result<Self, Error> {
        let attach = SemaphoreSet::allocate(&name, BULKHEAD_TYPE_TAG, SLOT_COUNT, DEFAULT_PERMISSIONS)
            .map_err(|e| Error::syscall(&name, e))?;
        if attach.created {
            attach
                .set
                .set_all(&[0; SLOT_COUNT as usize])
                .map_err(|e| Error::syscall(&name, e))?;
            // semop rather than SETVAL so sem_otime flips, which is what
            // attachers wait on before trusting the slot values.
            attach
                .set
                .adjust(SEM_LOCK, 1, None)
                .map_err(|e| Error::syscall(&name, e))?;
        } else {
            attach
                .set
                .wait_until_initialized(MEMBERSHIP_TIMEOUT)
                .map_err(|e| Error::syscall(&name, e))?;
        }

        let bulkhead = Bulkhead {
            name,
            set: attach.set,
            capacity: config.capacity,
            timeout: config.timeout,
            owner_pid: std::process::id(),
        };
        bulkhead.join()?;
        Ok(bulkhead)
    }

    /// Registers this worker and recomputes the ticket total.
    fn join(&self) -> Result<(), Error> {
        let _lock = self
            .set
            .scoped_wait(SEM_LOCK, Some(MEMBERSHIP_TIMEOUT))
            .map_err(|e| Error::syscall(&self.name, e))?;
        self.set
            .post(SEM_WORKERS)
            .map_err(|e| Error::syscall(&self.name, e))?;
        self.resize_locked()
    }

    /// Deregisters this worker on clean shutdown; crashed workers are
    /// reaped by semaphore undo instead.
    fn leave(&self) -> Result<(), Error> {
        let _lock = self
            .set
            .scoped_wait(SEM_LOCK, Some(MEMBERSHIP_TIMEOUT))
            .map_err(|e| Error::syscall(&self.name, e))?;
        self.set
            .try_wait(SEM_WORKERS)
            .map_err(|e| Error::syscall(&self.name, e))?;
        self.resize_locked()
    }

    /// Rewrites the ticket slot to the desired total, net of the previous
    /// configuration so in-flight holders are preserved. Callers hold the
    /// setup lock.
    fn resize_locked(&self) -> Result<(), Error> {
        let workers = self
            .set
            .value(SEM_WORKERS)
            .map_err(|e| Error::syscall(&self.name, e))?
            .max(1);
        let desired = match self.capacity {
            Capacity::Static(tickets) => tickets as i32,
            Capacity::Quota(quota) => (quota * workers as f64).ceil() as i32,
        };
        let configured = self
            .set
            .value(SEM_CONFIGURED)
            .map_err(|e| Error::syscall(&self.name, e))?;
        let delta = desired - configured;
        if delta == 0 {
            return Ok(());
        }
        self.set
            .adjust(SEM_TICKETS, delta as i16, Some(MEMBERSHIP_TIMEOUT))
            .map_err(|e| Error::syscall(&self.name, e))?;
        self.set
            .set_value(SEM_CONFIGURED, desired)
            .map_err(|e| Error::syscall(&self.name, e))?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Takes a ticket, holding it until the guard drops.
    pub fn ticket(&self, timeout: Option<Duration>) -> Result<SemGuard<'_>, Error> {
        let timeout = timeout.unwrap_or(self.timeout);
        self.set
            .scoped_wait(SEM_TICKETS, Some(timeout))
            .map_err(|e| Error::from_ipc(&self.name, e, timeout))
    }

    /// Scoped acquisition: runs `work` while holding a ticket.
    pub fn acquire<T>(&self, timeout: Option<Duration>, work: impl FnOnce() -> T) -> Result<T, Error> {
        let _ticket = self.ticket(timeout)?;
        Ok(work())
    }

    /// Workers currently registered across the host.
    pub fn registered_workers(&self) -> Result<i32, Error> {
        self.set
            .value(SEM_WORKERS)
            .map_err(|e| Error::syscall(&self.name, e))
    }

    /// The configured ticket total.
    pub fn tickets(&self) -> Result<i32, Error> {
        self.set
            .value(SEM_CONFIGURED)
            .map_err(|e| Error::syscall(&self.name, e))
    }

    /// Tickets currently available.
    pub fn count(&self) -> Result<i32, Error> {
        self.set
            .value(SEM_TICKETS)
            .map_err(|e| Error::syscall(&self.name, e))
    }

    /// Zeroes the worker count after operator intervention (e.g. a fleet
    /// that leaked registrations before undo semantics existed).
    pub fn reset_registered_workers(&self) -> Result<(), Error> {
        self.set
            .set_value(SEM_WORKERS, 0)
            .map_err(|e| Error::syscall(&self.name, e))
    }

    pub(crate) fn in_use(&self) -> bool {
        match (self.count(), self.tickets()) {
            (Ok(available), Ok(total)) => available < total,
            _ => false,
        }
    }

    /// Removes the semaphore set from the kernel. Idempotent.
    pub(crate) fn destroy(&self) -> Result<(), Error> {
        self.set.remove().map_err(|e| Error::syscall(&self.name, e))
    }
}

impl Drop for Bulkhead {
    fn drop(&mut self) {
        if std::process::id() != self.owner_pid {
            return;
        }
        if let Err(err) = self.leave() {
            // Expected when a sibling already destroyed the resource.
            debug!(name = %self.name, %err, "bulkhead leave failed");
        }
    }
}
