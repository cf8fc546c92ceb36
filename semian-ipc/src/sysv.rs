// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! SysV semaphore sets with kernel undo semantics.
//!
//! SysV semaphores are the one host-local primitive where the kernel itself
//! repairs the state of a crashed holder: every ticket wait and worker
//! registration here carries `SEM_UNDO`, so a process killed mid-hold has its
//! outstanding adjustments reverted by the kernel on exit. Administrative
//! adjustments (ticket resizes, explicit resets) deliberately do not carry
//! the flag, since they must outlive the process that performed them.
//!
//! A set is identified by a deterministic key derived from the resource name
//! (see [`crate::key`]). [`SemaphoreSet::allocate`] walks the nonce sequence
//! until it either creates a fresh set or attaches to a compatible existing
//! one, which resolves key collisions with foreign objects.

use crate::key;
use crate::IpcError;
use std::time::{Duration, Instant};
use tracing::warn;

/// Poll interval for platforms without `semtimedop` and for init waits.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// A handle to a SysV semaphore set.
///
/// The handle is plain data: dropping it detaches nothing, and the kernel
/// object persists until [`SemaphoreSet::remove`] or a host reboot.
#[derive(Debug, Clone, Copy)]
pub struct SemaphoreSet {
    id: libc::c_int,
    key: libc::key_t,
}

/// Result of [`SemaphoreSet::allocate`].
#[derive(Debug, Clone, Copy)]
pub struct Attach {
    pub set: SemaphoreSet,
    /// True when this process created the set and owns its initialization.
    pub created: bool,
}

#[repr(C)]
#[derive(Clone, Copy)]
union Semun {
    val: libc::c_int,
    buf: *mut libc::semid_ds,
    array: *mut libc::c_ushort,
}

fn sembuf(sem: u16, op: i16, flags: i16) -> libc::sembuf {
    libc::sembuf {
        sem_num: sem,
        sem_op: op,
        sem_flg: flags,
    }
}

impl SemaphoreSet {
    /// Creates or attaches to the set for `(name, type_tag)`.
    ///
    /// Walks the nonce sequence on collision: an existing set with the wrong
    /// semaphore count belongs to someone else, so every worker skips it and
    /// converges on the same replacement key.
    pub fn allocate(
        name: &str,
        type_tag: &str,
        nsems: u16,
        permissions: u32,
    ) -> crate::Result<Attach> {
        for nonce in 0..key::MAX_KEY_ATTEMPTS {
            let k = key::sysv_key(name, permissions, type_tag, nonce);
            // A remove racing with our attach surfaces as ENOENT; retry the
            // same key a few times before moving on.
            for _ in 0..3 {
                let flags = (permissions as libc::c_int) | libc::IPC_CREAT | libc::IPC_EXCL;
                let id = unsafe { libc::semget(k, nsems as libc::c_int, flags) };
                if id >= 0 {
                    return Ok(Attach {
                        set: SemaphoreSet { id, key: k },
                        created: true,
                    });
                }
                let errno = std::io::Error::last_os_error().raw_os_error();
                if errno != Some(libc::EEXIST) {
                    return Err(IpcError::last_syscall("semget"));
                }

                let id = unsafe { libc::semget(k, 0, permissions as libc::c_int) };
                if id < 0 {
                    match std::io::Error::last_os_error().raw_os_error() {
                        Some(libc::ENOENT) => continue, // lost a remove race
                        Some(libc::EACCES) => break,    // foreign object, rehash
                        _ => return Err(IpcError::last_syscall("semget")),
                    }
                }
                let set = SemaphoreSet { id, key: k };
                match set.stat() {
                    Ok(ds) if ds.sem_nsems as u16 == nsems => {
                        return Ok(Attach { set, created: false });
                    }
                    Ok(_) => break, // collision: incompatible layout, rehash
                    Err(e) if e.is_gone() => continue,
                    Err(e) => return Err(e),
                }
            }
        }
        Err(IpcError::Argument(format!(
            "could not allocate a semaphore key for resource `{name}` after {} attempts",
            key::MAX_KEY_ATTEMPTS
        )))
    }

    pub fn key(&self) -> libc::key_t {
        self.key
    }

    /// Blocks until the creator has run its first `semop`.
    ///
    /// `sem_otime` stays zero until the first successful `semop` on the set,
    /// which is the classic SysV handshake for "creator finished SETALL".
    pub fn wait_until_initialized(&self, timeout: Duration) -> crate::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stat()?.sem_otime != 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(IpcError::Timeout(timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Decrements `sem` by one with `SEM_UNDO`, waiting up to `timeout`.
    pub fn wait(&self, sem: u16, timeout: Option<Duration>) -> crate::Result<()> {
        let mut ops = [sembuf(sem, -1, libc::SEM_UNDO as i16)];
        self.op(&mut ops, timeout)
    }

    /// Non-blocking decrement with `SEM_UNDO`; false when the count is zero.
    pub fn try_wait(&self, sem: u16) -> crate::Result<bool> {
        let mut ops = [sembuf(
            sem,
            -1,
            (libc::SEM_UNDO | libc::IPC_NOWAIT) as i16,
        )];
        match self.semop_once(&mut ops) {
            Ok(()) => Ok(true),
            Err(e) if is_errno(&e, libc::EAGAIN) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Increments `sem` by one with `SEM_UNDO`. Never blocks.
    pub fn post(&self, sem: u16) -> crate::Result<()> {
        let mut ops = [sembuf(sem, 1, libc::SEM_UNDO as i16)];
        self.semop_once(&mut ops)
    }

    /// Adjusts `sem` by `delta` without undo, waiting up to `timeout` when
    /// the adjustment has to wait for in-flight holders.
    ///
    /// This is the resize primitive: the adjustment must survive this
    /// process, so it carries no `SEM_UNDO`.
    pub fn adjust(&self, sem: u16, delta: i16, timeout: Option<Duration>) -> crate::Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut ops = [sembuf(sem, delta, 0)];
        self.op(&mut ops, timeout)
    }

    /// Scoped decrement: the returned guard re-increments on drop, covering
    /// every exit path in-process; `SEM_UNDO` covers the paths out of it.
    pub fn scoped_wait(&self, sem: u16, timeout: Option<Duration>) -> crate::Result<SemGuard<'_>> {
        self.wait(sem, timeout)?;
        Ok(SemGuard { set: self, sem })
    }

    /// Non-blocking variant of [`SemaphoreSet::scoped_wait`]; `None` when
    /// the slot is contended.
    pub fn try_scoped_wait(&self, sem: u16) -> crate::Result<Option<SemGuard<'_>>> {
        if self.try_wait(sem)? {
            Ok(Some(SemGuard { set: self, sem }))
        } else {
            Ok(None)
        }
    }

    pub fn value(&self, sem: u16) -> crate::Result<i32> {
        let arg = Semun { val: 0 };
        let rc = unsafe { libc::semctl(self.id, sem as libc::c_int, libc::GETVAL, arg) };
        if rc < 0 {
            return Err(IpcError::last_syscall("semctl(GETVAL)"));
        }
        Ok(rc)
    }

    pub fn set_value(&self, sem: u16, value: i32) -> crate::Result<()> {
        let arg = Semun { val: value };
        let rc = unsafe { libc::semctl(self.id, sem as libc::c_int, libc::SETVAL, arg) };
        if rc < 0 {
            return Err(IpcError::last_syscall("semctl(SETVAL)"));
        }
        Ok(())
    }

    pub fn set_all(&self, values: &[u16]) -> crate::Result<()> {
        let mut values = values.to_vec();
        let arg = Semun {
            array: values.as_mut_ptr(),
        };
        let rc = unsafe { libc::semctl(self.id, 0, libc::SETALL, arg) };
        if rc < 0 {
            return Err(IpcError::last_syscall("semctl(SETALL)"));
        }
        Ok(())
    }

    pub fn stat(&self) -> crate::Result<libc::semid_ds> {
        let mut ds: libc::semid_ds = unsafe { std::mem::zeroed() };
        let arg = Semun { buf: &mut ds };
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_STAT, arg) };
        if rc < 0 {
            return Err(IpcError::last_syscall("semctl(IPC_STAT)"));
        }
        Ok(ds)
    }

    /// Removes the kernel object. Idempotent: a set already removed by a
    /// sibling worker is success.
    pub fn remove(&self) -> crate::Result<()> {
        let arg = Semun { val: 0 };
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_RMID, arg) };
        if rc < 0 {
            let err = IpcError::last_syscall("semctl(IPC_RMID)");
            if err.is_gone() {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn semop_once(&self, ops: &mut [libc::sembuf]) -> crate::Result<()> {
        loop {
            let rc = unsafe { libc::semop(self.id, ops.as_mut_ptr(), ops.len()) };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(IpcError::Syscall {
                op: "semop",
                source: err,
            });
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn op(&self, ops: &mut [libc::sembuf], timeout: Option<Duration>) -> crate::Result<()> {
        let Some(timeout) = timeout else {
            return self.semop_once(ops);
        };
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let ts = libc::timespec {
                tv_sec: remaining.as_secs() as libc::time_t,
                tv_nsec: remaining.subsec_nanos() as libc::c_long,
            };
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_semtimedop,
                    self.id,
                    ops.as_mut_ptr(),
                    ops.len(),
                    &ts,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) if Instant::now() < deadline => continue,
                Some(libc::EAGAIN) | Some(libc::EINTR) => return Err(IpcError::Timeout(timeout)),
                _ => return Err(IpcError::last_syscall("semtimedop")),
            }
        }
    }

    // No semtimedop outside Linux: emulate the timed wait with a non-blocking
    // poll loop.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn op(&self, ops: &mut [libc::sembuf], timeout: Option<Duration>) -> crate::Result<()> {
        let Some(timeout) = timeout else {
            return self.semop_once(ops);
        };
        let deadline = Instant::now() + timeout;
        let mut polled: Vec<libc::sembuf> = ops
            .iter()
            .map(|op| libc::sembuf {
                sem_num: op.sem_num,
                sem_op: op.sem_op,
                sem_flg: op.sem_flg | libc::IPC_NOWAIT as i16,
            })
            .collect();
        loop {
            match self.semop_once(&mut polled) {
                Ok(()) => return Ok(()),
                Err(e) if is_errno(&e, libc::EAGAIN) => {
                    if Instant::now() >= deadline {
                        return Err(IpcError::Timeout(timeout));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_errno(err: &IpcError, errno: i32) -> bool {
    matches!(err, IpcError::Syscall { source, .. } if source.raw_os_error() == Some(errno))
}

/// RAII ticket held on a semaphore slot.
#[derive(Debug)]
pub struct SemGuard<'a> {
    set: &'a SemaphoreSet,
    sem: u16,
}

impl Drop for SemGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.set.post(self.sem) {
            // The set can legitimately be gone if a sibling destroyed the
            // resource while we held a ticket.
            if !err.is_gone() {
                warn!(sem = self.sem, %err, "failed to release semaphore ticket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::DEFAULT_PERMISSIONS;

    fn unique_name(tag: &str) -> String {
        format!("sysv-test-{tag}-{}", std::process::id())
    }

    fn allocate(name: &str, nsems: u16) -> Attach {
        SemaphoreSet::allocate(name, "test", nsems, DEFAULT_PERMISSIONS).unwrap()
    }

    #[test]
    fn create_set_values_and_wait() {
        let name = unique_name("basic");
        let attach = allocate(&name, 2);
        assert!(attach.created);
        let set = attach.set;

        set.set_all(&[3, 0]).unwrap();
        assert_eq!(set.value(0).unwrap(), 3);
        assert_eq!(set.value(1).unwrap(), 0);

        set.wait(0, None).unwrap();
        assert_eq!(set.value(0).unwrap(), 2);
        set.post(0).unwrap();
        assert_eq!(set.value(0).unwrap(), 3);

        set.remove().unwrap();
    }

    #[test]
    fn second_allocate_attaches() {
        let name = unique_name("attach");
        let first = allocate(&name, 4);
        assert!(first.created);
        first.set.set_all(&[0, 0, 0, 0]).unwrap();
        first.set.post(0).unwrap(); // marks initialized

        let second = allocate(&name, 4);
        assert!(!second.created);
        second
            .set
            .wait_until_initialized(Duration::from_secs(1))
            .unwrap();
        assert_eq!(second.set.value(0).unwrap(), 1);

        first.set.remove().unwrap();
    }

    #[test]
    fn timed_wait_expires() {
        let name = unique_name("timeout");
        let set = allocate(&name, 1).set;
        set.set_value(0, 0).unwrap();

        let start = Instant::now();
        let err = set.wait(0, Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, IpcError::Timeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(45));

        set.remove().unwrap();
    }

    #[test]
    fn try_wait_reports_contention() {
        let name = unique_name("trywait");
        let set = allocate(&name, 1).set;
        set.set_value(0, 1).unwrap();

        assert!(set.try_wait(0).unwrap());
        assert!(!set.try_wait(0).unwrap());
        set.post(0).unwrap();

        set.remove().unwrap();
    }

    #[test]
    fn guard_releases_on_drop_and_panic() {
        let name = unique_name("guard");
        let set = allocate(&name, 1).set;
        set.set_value(0, 1).unwrap();

        {
            let _guard = set.scoped_wait(0, None).unwrap();
            assert_eq!(set.value(0).unwrap(), 0);
        }
        assert_eq!(set.value(0).unwrap(), 1);

        let result = std::panic::catch_unwind(|| {
            let _guard = set.scoped_wait(0, None).unwrap();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(set.value(0).unwrap(), 1);

        set.remove().unwrap();
    }

    #[test]
    fn remove_is_idempotent() {
        let name = unique_name("rmid");
        let set = allocate(&name, 1).set;
        set.remove().unwrap();
        set.remove().unwrap();
    }

    #[test]
    fn adjust_moves_by_delta() {
        let name = unique_name("adjust");
        let set = allocate(&name, 1).set;
        set.set_value(0, 2).unwrap();

        set.adjust(0, 3, None).unwrap();
        assert_eq!(set.value(0).unwrap(), 5);
        set.adjust(0, -4, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(set.value(0).unwrap(), 1);

        set.remove().unwrap();
    }
}
