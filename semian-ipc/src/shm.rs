// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory segments and mappings.
//!
//! Named segments back cross-process controller state and are keyed by the
//! resource name (see [`crate::key::shm_path`]). They are never unlinked on
//! drop: the segment must outlive any single worker, and only an explicit
//! destroy removes it. Anonymous segments back the process-local fallback
//! when shared coordination is disabled.

use crate::IpcError;
use io_lifetimes::OwnedFd;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::MetadataExt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};

/// Rounds `size` up to the mapping granularity.
pub fn page_aligned(size: usize) -> usize {
    let page = page_size::get();
    size.div_ceil(page) * page
}

/// An open file-backed memory region of known size.
pub trait MemoryHandle {
    fn size(&self) -> usize;
    fn fd(&self) -> BorrowedFd<'_>;
}

/// Anonymous shared-memory segment, visible only through inherited fds.
#[derive(Debug)]
pub struct ShmHandle {
    handle: OwnedFd,
    size: usize,
}

/// Name of a named segment in the shm namespace.
#[derive(Debug)]
pub struct ShmPath {
    name: CString,
}

/// Named shared-memory segment, attachable by any worker on the host.
#[derive(Debug)]
pub struct NamedShmHandle {
    inner: ShmHandle,
    path: ShmPath,
}

static ANON_SHM_ID: AtomicI32 = AtomicI32::new(0);

impl ShmHandle {
    #[cfg(target_os = "linux")]
    fn open_anon_shm() -> crate::Result<OwnedFd> {
        if let Ok(memfd) = memfd::MemfdOptions::default().create("semian-anon") {
            Ok(memfd.into_file().into())
        } else {
            Self::open_anon_shm_generic()
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn open_anon_shm() -> crate::Result<OwnedFd> {
        Self::open_anon_shm_generic()
    }

    fn open_anon_shm_generic() -> crate::Result<OwnedFd> {
        let path = format!(
            "/semian-anon-{}-{}",
            std::process::id(),
            ANON_SHM_ID.fetch_add(1, Ordering::SeqCst)
        );
        let fd = shm_open(
            path.as_bytes(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| IpcError::syscall("shm_open", e))?;
        let _ = shm_unlink(path.as_bytes());
        Ok(fd)
    }

    /// A fresh zero-filled anonymous segment of `size` bytes.
    pub fn new(size: usize) -> crate::Result<ShmHandle> {
        let size = page_aligned(size);
        let handle = Self::open_anon_shm()?;
        ftruncate(&handle, size as libc::off_t).map_err(|e| IpcError::syscall("ftruncate", e))?;
        Ok(ShmHandle { handle, size })
    }

    pub fn map(self) -> crate::Result<MappedMem<ShmHandle>> {
        mmap_handle(self)
    }
}

impl NamedShmHandle {
    /// Creates the segment, or attaches when a sibling worker got there
    /// first. The boolean is true for the creator.
    ///
    /// A sibling that crashed between `shm_open` and `ftruncate` leaves a
    /// zero-length object behind; attachers grow it back to `size`, which
    /// zero-fills, and the in-segment init handshake takes it from there.
    pub fn create_or_open(
        path: CString,
        size: usize,
        permissions: u32,
    ) -> crate::Result<(Self, bool)> {
        let mode = Mode::from_bits_truncate(permissions as libc::mode_t);
        let size = page_aligned(size);
        for _ in 0..3 {
            match shm_open(
                path.as_c_str(),
                OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
                mode,
            ) {
                Ok(fd) => {
                    ftruncate(&fd, size as libc::off_t)
                        .map_err(|e| IpcError::syscall("ftruncate", e))?;
                    return Ok((Self::from_parts(fd, path, size), true));
                }
                Err(nix::errno::Errno::EEXIST) => {}
                Err(e) => return Err(IpcError::syscall("shm_open", e)),
            }
            match Self::open_sized(path.as_c_str(), size) {
                Ok(handle) => return Ok((handle, false)),
                // Lost a race against shm_unlink; create again.
                Err(e) if e.is_gone() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(IpcError::Argument(format!(
            "shared memory object {path:?} is flapping between create and unlink"
        )))
    }

    /// Attaches to an existing segment, taking its current size.
    pub fn open(path: &CStr) -> crate::Result<NamedShmHandle> {
        let fd = shm_open(path, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| IpcError::syscall("shm_open", e))?;
        let file: File = fd.into();
        let size = file
            .metadata()
            .map_err(|source| IpcError::Syscall {
                op: "fstat",
                source,
            })?
            .size() as usize;
        Ok(Self::from_parts(file.into(), path.to_owned(), size))
    }

    fn open_sized(path: &CStr, size: usize) -> crate::Result<NamedShmHandle> {
        let handle = Self::open(path)?;
        if handle.inner.size >= size {
            return Ok(handle);
        }
        ftruncate(handle.fd(), size as libc::off_t)
            .map_err(|e| IpcError::syscall("ftruncate", e))?;
        Ok(NamedShmHandle {
            inner: ShmHandle {
                handle: handle.inner.handle,
                size,
            },
            path: handle.path,
        })
    }

    fn from_parts(fd: OwnedFd, path: CString, size: usize) -> NamedShmHandle {
        NamedShmHandle {
            inner: ShmHandle { handle: fd, size },
            path: ShmPath { name: path },
        }
    }

    pub fn path(&self) -> &CStr {
        &self.path.name
    }

    pub fn map(self) -> crate::Result<MappedMem<NamedShmHandle>> {
        mmap_handle(self)
    }

    /// Removes the segment name from the host. Idempotent.
    pub fn unlink(path: &CStr) -> crate::Result<()> {
        match shm_unlink(path) {
            Ok(()) | Err(nix::errno::Errno::ENOENT) => Ok(()),
            Err(e) => Err(IpcError::syscall("shm_unlink", e)),
        }
    }
}

impl MemoryHandle for ShmHandle {
    fn size(&self) -> usize {
        self.size
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.handle.as_fd()
    }
}

impl MemoryHandle for NamedShmHandle {
    fn size(&self) -> usize {
        self.inner.size
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.inner.fd()
    }
}

/// A live `MAP_SHARED` mapping of a [`MemoryHandle`].
#[derive(Debug)]
pub struct MappedMem<T: MemoryHandle> {
    ptr: NonNull<libc::c_void>,
    mem: T,
}

fn mmap_handle<T: MemoryHandle>(mem: T) -> crate::Result<MappedMem<T>> {
    // Infallible: page_aligned never returns 0 for the sizes we create.
    let len = NonZeroUsize::new(mem.size())
        .ok_or_else(|| IpcError::Argument("cannot map an empty segment".into()))?;
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            mem.fd(),
            0,
        )
        .map_err(|e| IpcError::syscall("mmap", e))?
    };
    Ok(MappedMem { ptr, mem })
}

impl<T: MemoryHandle> MappedMem<T> {
    pub fn len(&self) -> usize {
        self.mem.size()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.size() == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    pub fn handle(&self) -> &T {
        &self.mem
    }

    /// Views the start of the mapping as `S`.
    ///
    /// # Safety
    ///
    /// `S` must be `#[repr(C)]`, fit in the mapping, tolerate any bit
    /// pattern, and perform all interior mutation through atomics.
    pub unsafe fn shared<S>(&self) -> &S {
        assert!(std::mem::size_of::<S>() <= self.mem.size());
        assert_eq!(self.ptr.as_ptr() as usize % std::mem::align_of::<S>(), 0);
        &*self.ptr.as_ptr().cast()
    }
}

// The mapping is MAP_SHARED and all access goes through atomics or &self
// methods; the raw pointer is what stops the auto-impl.
unsafe impl<T: MemoryHandle + Send> Send for MappedMem<T> {}
unsafe impl<T: MemoryHandle + Sync> Sync for MappedMem<T> {}

impl<T: MemoryHandle> Drop for MappedMem<T> {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.mem.size());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn anonymous_segment_is_zeroed_and_writable() {
        let mapped = ShmHandle::new(128).unwrap().map().unwrap();
        assert!(mapped.len() >= 128);
        let word: &AtomicU64 = unsafe { mapped.shared() };
        assert_eq!(word.load(Ordering::Relaxed), 0);
        word.store(0xdead_beef, Ordering::Relaxed);
        assert_eq!(word.load(Ordering::Relaxed), 0xdead_beef);
    }

    #[test]
    fn named_segment_round_trips_between_handles() {
        let path = CString::new(format!("/semian-test-{}", std::process::id())).unwrap();
        let (creator, created) =
            NamedShmHandle::create_or_open(path.clone(), 64, 0o600)
                .unwrap();
        assert!(created);
        let mapped = creator.map().unwrap();
        let word: &AtomicU64 = unsafe { mapped.shared() };
        word.store(42, Ordering::SeqCst);

        let (attached, created) =
            NamedShmHandle::create_or_open(path.clone(), 64, 0o600)
                .unwrap();
        assert!(!created);
        let mapped2 = attached.map().unwrap();
        let word2: &AtomicU64 = unsafe { mapped2.shared() };
        assert_eq!(word2.load(Ordering::SeqCst), 42);

        NamedShmHandle::unlink(&path).unwrap();
        NamedShmHandle::unlink(&path).unwrap();
    }

    #[test]
    fn mapping_outlives_unlink() {
        let path = CString::new(format!("/semian-test-unlink-{}", std::process::id())).unwrap();
        let (handle, _) =
            NamedShmHandle::create_or_open(path.clone(), 64, 0o600)
                .unwrap();
        let mapped = handle.map().unwrap();
        NamedShmHandle::unlink(&path).unwrap();

        let word: &AtomicU64 = unsafe { mapped.shared() };
        word.store(7, Ordering::SeqCst);
        assert_eq!(word.load(Ordering::SeqCst), 7);
    }
}
