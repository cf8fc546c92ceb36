// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deterministic IPC identity for a resource name.
//!
//! Every worker on the host must independently derive the same SysV key and
//! shared-memory path from a resource name, so the hash has to be stable
//! across processes: zwohash is seedless, unlike the std SipHash which is
//! randomized per process.
//!
//! The `nonce` parameter resolves key collisions. A caller that attaches to a
//! key and finds an incompatible object (wrong semaphore count, foreign
//! owner) retries with `nonce + 1`; all workers walk the same nonce sequence
//! and converge on the same replacement key.

use std::ffi::CString;
use std::hash::{Hash, Hasher};
use zwohash::ZwoHasher;

/// Default permission bits for kernel objects created by this crate.
pub const DEFAULT_PERMISSIONS: u32 = 0o660;

/// How many nonce steps to walk before declaring the key space hostile.
pub const MAX_KEY_ATTEMPTS: u64 = 16;

fn fold_hash(name: &str, permissions: u32, type_tag: &str, nonce: u64) -> u64 {
    let mut hasher = ZwoHasher::default();
    type_tag.hash(&mut hasher);
    permissions.hash(&mut hasher);
    name.hash(&mut hasher);
    nonce.hash(&mut hasher);
    hasher.finish()
}

/// SysV key for `(name, permissions, type_tag, nonce)`.
///
/// Folds the 64-bit hash into the 32-bit `key_t` namespace and steers clear
/// of `IPC_PRIVATE` (key 0), which has create-only semantics.
pub fn sysv_key(name: &str, permissions: u32, type_tag: &str, nonce: u64) -> libc::key_t {
    let folded = fold_hash(name, permissions, type_tag, nonce);
    let key = (folded ^ (folded >> 32)) as u32 as libc::key_t;
    if key == 0 {
        1
    } else {
        key
    }
}

/// Shared-memory object name for `(name, permissions, type_tag, nonce)`.
///
/// The resource name itself is not embedded: it may contain bytes that are
/// invalid in a shm path, and the hex hash keeps the path well under the
/// portable name limit.
pub fn shm_path(name: &str, permissions: u32, type_tag: &str, nonce: u64) -> CString {
    let folded = fold_hash(name, permissions, type_tag, nonce);
    // Infallible: the formatted string contains no interior NUL.
    #[allow(clippy::unwrap_used)]
    CString::new(format!("/semian-{type_tag}-{folded:016x}")).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("mysql_shard_0")]
    #[case("redis")]
    #[case("a name with spaces / and slashes")]
    fn key_is_deterministic(#[case] name: &str) {
        let a = sysv_key(name, DEFAULT_PERMISSIONS, "bulkhead", 0);
        let b = sysv_key(name, DEFAULT_PERMISSIONS, "bulkhead", 0);
        assert_eq!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn key_varies_by_tag_permissions_and_nonce() {
        let base = sysv_key("db", DEFAULT_PERMISSIONS, "bulkhead", 0);
        assert_ne!(base, sysv_key("db", DEFAULT_PERMISSIONS, "adaptive", 0));
        assert_ne!(base, sysv_key("db", 0o600, "bulkhead", 0));
        assert_ne!(base, sysv_key("db", DEFAULT_PERMISSIONS, "bulkhead", 1));
    }

    #[test]
    fn shm_path_is_stable_and_well_formed() {
        let path = shm_path("mysql/primary", DEFAULT_PERMISSIONS, "adaptive", 0);
        let s = path.to_str().unwrap();
        assert!(s.starts_with("/semian-adaptive-"));
        assert!(s.len() < 64);
        assert_eq!(
            path,
            shm_path("mysql/primary", DEFAULT_PERMISSIONS, "adaptive", 0)
        );
    }
}
