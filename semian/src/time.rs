// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Monotonic timestamps.
//!
//! Timestamps are `Duration`s on the host's monotonic clock, which is shared
//! by every process on the host; cross-process state (the adaptive
//! controller's last-update stamp) can therefore compare stamps taken by
//! different workers. Internal operations accept an `Option<Duration>`
//! timestamp so tests can drive time explicitly.

use std::time::Duration;

/// Now, on `CLOCK_MONOTONIC`.
#[cfg(unix)]
pub(crate) fn monotonic() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

#[cfg(not(unix))]
pub(crate) fn monotonic() -> Duration {
    use std::sync::LazyLock;
    use std::time::Instant;
    static ANCHOR: LazyLock<Instant> = LazyLock::new(Instant::now);
    ANCHOR.elapsed()
}

pub(crate) fn resolve(ts: Option<Duration>) -> Duration {
    ts.unwrap_or_else(monotonic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_goes_backwards() {
        let a = monotonic();
        let b = monotonic();
        assert!(b >= a);
        assert!(a > Duration::ZERO);
    }

    #[test]
    fn resolve_prefers_the_injected_stamp() {
        let ts = Duration::from_secs(42);
        assert_eq!(resolve(Some(ts)), ts);
        assert!(resolve(None) > Duration::ZERO);
    }
}
